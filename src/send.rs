//! Sender side of the endpoint: the window of unacknowledged segments,
//! the adaptive RTO, and the flow-control view of the peer.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::clock::{Deadline, Millis};
use crate::wire::Packet;

/// Most segments allowed in flight at once.
pub const WINDOW_SIZE: usize = 4;

const RTT_ALPHA: f64 = 0.125;
const RTT_BETA: f64 = 0.25;
const RTO_FLOOR: f64 = 100.0;
const RTO_CEIL: f64 = 5000.0;
const RTO_INITIAL: f64 = 1000.0;
const RTT_INITIAL: f64 = 500.0;

/// Smoothed round-trip estimation driving the retransmission timeout.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    estimated: f64,
    dev: f64,
    rto: f64,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            estimated: RTT_INITIAL,
            dev: 0.0,
            rto: RTO_INITIAL,
        }
    }

    /// Fold one measured round trip into the estimate.
    pub fn sample(&mut self, sample_ms: f64) {
        self.estimated = (1.0 - RTT_ALPHA) * self.estimated + RTT_ALPHA * sample_ms;
        self.dev = (1.0 - RTT_BETA) * self.dev + RTT_BETA * (sample_ms - self.estimated).abs();
        self.rto = (self.estimated + 4.0 * self.dev).clamp(RTO_FLOOR, RTO_CEIL);

        trace!(
            estimated = self.estimated,
            dev = self.dev,
            rto = self.rto,
            "rtt sample {sample_ms}ms"
        );
    }

    /// Exponential back-off after a retransmission.
    pub fn back_off(&mut self) {
        self.rto = (2.0 * self.rto).min(RTO_CEIL);
    }

    pub fn rto(&self) -> Millis {
        self.rto as Millis
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Why `try_enqueue` refused a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    /// All [`WINDOW_SIZE`] slots hold unacknowledged segments.
    WindowFull,
    /// Sending would overrun the peer's advertised window.
    FlowControlled,
}

/// One transmitted, not yet acknowledged segment. The encoded frame is
/// retained until the cumulative ACK passes it, so a retransmission is a
/// plain resend.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    frame: Bytes,
    seq: u32,
    len: usize,
    sent_at: Millis,
    retransmitted: bool,
}

impl Segment {
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.len as u32)
    }
}

/// What an incoming cumulative ACK did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    pub released: usize,
    pub rtt_sampled: bool,
}

#[derive(Debug)]
pub struct SendWindow {
    segments: VecDeque<Segment>,
    next_seq: u32,
    last_byte_sent: u32,
    last_byte_acked: u32,
    peer_window: u16,
    rtt: RttEstimator,
}

impl SendWindow {
    /// The data stream starts at sequence 1; the handshake ISNs live in a
    /// separate arithmetic handled by the connection.
    pub fn new(peer_window: u16) -> Self {
        SendWindow {
            segments: VecDeque::with_capacity(WINDOW_SIZE),
            next_seq: 1,
            last_byte_sent: 0,
            last_byte_acked: 0,
            peer_window,
            rtt: RttEstimator::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn peer_window(&self) -> u16 {
        self.peer_window
    }

    pub fn rto(&self) -> Millis {
        self.rtt.rto()
    }

    /// Payload bytes sent but not yet acknowledged.
    pub fn bytes_in_flight(&self) -> u32 {
        self.last_byte_sent.wrapping_sub(self.last_byte_acked)
    }

    /// Admit one payload if both the segment window and the peer's
    /// advertised window have room. On success the segment is queued and
    /// returned for transmission.
    pub fn try_enqueue(
        &mut self,
        payload: &[u8],
        ack: u32,
        window: u16,
        now: Millis,
    ) -> Result<&Segment, Blocked> {
        if self.segments.len() >= WINDOW_SIZE {
            return Err(Blocked::WindowFull);
        }
        if self.bytes_in_flight() as usize + payload.len() > self.peer_window as usize {
            return Err(Blocked::FlowControlled);
        }

        let len = payload.len();
        let packet = Packet::data(self.next_seq, ack, window, Bytes::copy_from_slice(payload));

        self.segments.push_back(Segment {
            frame: packet.encode(),
            seq: self.next_seq,
            len,
            sent_at: now,
            retransmitted: false,
        });

        self.last_byte_sent = self.next_seq.wrapping_add(len as u32).wrapping_sub(1);
        self.next_seq = self.next_seq.wrapping_add(len as u32);

        trace!(
            seq = self.segments.back().unwrap().seq,
            len,
            in_flight = self.bytes_in_flight(),
            "segment queued"
        );

        Ok(self.segments.back().unwrap())
    }

    /// Apply a cumulative ACK: adopt the advertised window, slide every
    /// fully covered segment out in send order, and sample the RTT from
    /// the oldest released segment unless it was ever retransmitted.
    pub fn on_ack(&mut self, ack: u32, advertised: u16, now: Millis) -> AckOutcome {
        self.peer_window = advertised;

        let sample = self
            .segments
            .front()
            .filter(|seg| seg.end() <= ack && !seg.retransmitted)
            .map(|seg| now.saturating_sub(seg.sent_at));

        let mut released = 0;
        while let Some(seg) = self.segments.front() {
            if seg.end() > ack {
                break;
            }

            let seg = self.segments.pop_front().unwrap();
            self.last_byte_acked = seg.seq.wrapping_add(seg.len as u32).wrapping_sub(1);
            released += 1;

            debug!(seq = seg.seq, len = seg.len, "segment acknowledged");
        }

        if let Some(sample) = sample {
            self.rtt.sample(sample as f64);
        }

        if released > 0 {
            debug!(
                in_flight = self.bytes_in_flight(),
                peer_window = self.peer_window,
                "flow state updated"
            );
        }

        AckOutcome {
            released,
            rtt_sampled: sample.is_some(),
        }
    }

    /// Expiry of the oldest segment, for the event loop's deadline pick.
    pub fn rto_deadline(&self) -> Option<Deadline> {
        self.segments
            .front()
            .map(|seg| Deadline::after(seg.sent_at, self.rtt.rto()))
    }

    /// If the oldest segment has aged past the RTO, restamp it, back the
    /// RTO off, mark it so its eventual ACK yields no RTT sample, and hand
    /// it back for retransmission.
    pub fn due_retransmit(&mut self, now: Millis) -> Option<&Segment> {
        let rto = self.rtt.rto();
        let seg = self.segments.front_mut()?;

        if now.saturating_sub(seg.sent_at) < rto {
            return None;
        }

        seg.sent_at = now;
        seg.retransmitted = true;
        self.rtt.back_off();

        Some(&self.segments[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(win: &mut SendWindow, payloads: &[&[u8]], now: Millis) {
        for p in payloads {
            win.try_enqueue(p, 0, 8192, now).unwrap();
        }
    }

    #[test]
    fn blocks_when_window_full() {
        let mut win = SendWindow::new(8192);
        fill(&mut win, &[b"aaaa", b"bbbb", b"cccc", b"dddd"], 0);

        assert_eq!(win.try_enqueue(b"eeee", 0, 8192, 0), Err(Blocked::WindowFull));
    }

    #[test]
    fn blocks_when_flow_controlled() {
        let mut win = SendWindow::new(6);
        win.try_enqueue(b"aaaa", 0, 8192, 0).unwrap();

        assert_eq!(
            win.try_enqueue(b"bbbb", 0, 8192, 0),
            Err(Blocked::FlowControlled)
        );
        assert!(win.bytes_in_flight() <= win.peer_window() as u32);
    }

    #[test]
    fn zero_window_halts_transmission() {
        let mut win = SendWindow::new(0);
        assert_eq!(
            win.try_enqueue(b"x", 0, 8192, 0),
            Err(Blocked::FlowControlled)
        );

        // An ACK reopening the window resumes it.
        win.on_ack(1, 1024, 0);
        assert!(win.try_enqueue(b"x", 0, 8192, 0).is_ok());
    }

    #[test]
    fn sequences_are_contiguous() {
        let mut win = SendWindow::new(8192);
        fill(&mut win, &[b"aaaa", b"bb", b"ccc"], 0);

        assert_eq!(win.segments[0].seq, 1);
        assert_eq!(win.segments[1].seq, 5);
        assert_eq!(win.segments[2].seq, 7);
        assert_eq!(win.next_seq(), 10);
        assert_eq!(win.last_byte_sent, 9);
    }

    #[test]
    fn cumulative_ack_releases_multiple_segments() {
        let mut win = SendWindow::new(8192);
        fill(&mut win, &[b"aaaa", b"bbbb", b"cccc"], 0);

        let out = win.on_ack(9, 8192, 10);
        assert_eq!(out.released, 2);
        assert_eq!(win.last_byte_acked, 8);
        assert_eq!(win.bytes_in_flight(), 4);

        let out = win.on_ack(13, 8192, 20);
        assert_eq!(out.released, 1);
        assert!(win.is_empty());
        assert_eq!(win.bytes_in_flight(), 0);
    }

    #[test]
    fn stale_ack_releases_nothing() {
        let mut win = SendWindow::new(8192);
        fill(&mut win, &[b"aaaa"], 0);

        let out = win.on_ack(1, 8192, 10);
        assert_eq!(out.released, 0);
        assert!(!out.rtt_sampled);
        assert_eq!(win.bytes_in_flight(), 4);
    }

    #[test]
    fn last_byte_acked_strictly_increases() {
        let mut win = SendWindow::new(8192);
        fill(&mut win, &[b"aaaa", b"bbbb"], 0);

        win.on_ack(5, 8192, 10);
        let first = win.last_byte_acked;
        win.on_ack(9, 8192, 20);
        assert!(win.last_byte_acked > first);
    }

    #[test]
    fn rtt_sampled_from_fresh_segment() {
        let mut win = SendWindow::new(8192);
        fill(&mut win, &[b"aaaa"], 100);

        let out = win.on_ack(5, 8192, 400);
        assert!(out.rtt_sampled);
        // estimated = 0.875*500 + 0.125*300 = 475, dev = 0.25*|300-475| = 43.75
        assert_eq!(win.rto(), 650);
    }

    #[test]
    fn karn_skips_retransmitted_segment() {
        let mut win = SendWindow::new(8192);
        fill(&mut win, &[b"aaaa"], 0);

        assert!(win.due_retransmit(1000).is_some());
        let out = win.on_ack(5, 8192, 1200);
        assert_eq!(out.released, 1);
        assert!(!out.rtt_sampled);
    }

    #[test]
    fn retransmit_fires_only_after_rto() {
        let mut win = SendWindow::new(8192);
        fill(&mut win, &[b"aaaa"], 0);

        assert!(win.due_retransmit(999).is_none());
        let seg = win.due_retransmit(1000).unwrap();
        assert_eq!(seg.seq(), 1);
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let mut win = SendWindow::new(8192);
        fill(&mut win, &[b"aaaa"], 0);

        let mut now = 0;
        let mut seen = Vec::new();
        for _ in 0..4 {
            now += win.rto();
            win.due_retransmit(now).unwrap();
            seen.push(win.rto());
        }
        assert_eq!(seen, vec![2000, 4000, 5000, 5000]);
    }

    #[test]
    fn rto_stays_in_bounds() {
        let mut rtt = RttEstimator::new();
        for _ in 0..50 {
            rtt.sample(1.0);
        }
        assert!(rtt.rto() >= 100);

        for _ in 0..50 {
            rtt.sample(60_000.0);
        }
        assert!(rtt.rto() <= 5000);
    }

    #[test]
    fn rto_deadline_tracks_oldest_segment() {
        let mut win = SendWindow::new(8192);
        assert!(win.rto_deadline().is_none());

        fill(&mut win, &[b"aaaa", b"bbbb"], 300);
        assert_eq!(win.rto_deadline(), Some(Deadline::after(300, 1000)));
    }
}
