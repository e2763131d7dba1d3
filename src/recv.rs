//! Receiver side of the endpoint: in-order delivery, the fixed set of
//! out-of-order slots, and the advertised-window accounting.

use bytes::Bytes;
use tracing::{debug, trace};

/// Out-of-order slots available for reassembly.
pub const MAX_BUFFER_PACKETS: usize = 10;

/// Total receive buffer backing the advertised window.
pub const RECEIVER_BUFFER_SIZE: u16 = 8192;

/// Why an incoming data packet was discarded. The discard is local; the
/// cumulative ACK that follows tells the sender everything it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Already delivered or already sitting in a slot.
    Duplicate,
    /// The payload does not fit in the advertised window.
    NoSpace,
    /// Window space remains but every slot is occupied.
    SlotsFull,
}

/// Outcome of [`RecvWindow::on_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// The packet was in order. Carries its payload plus every buffered
    /// payload the advance unlocked, in stream order.
    Delivered(Vec<Bytes>),
    /// The packet landed ahead of the stream and was stashed in a slot.
    Buffered,
    Dropped(DropReason),
}

#[derive(Debug)]
struct Slot {
    seq: u32,
    payload: Bytes,
}

#[derive(Debug)]
pub struct RecvWindow {
    /// Smallest byte offset not yet delivered in order.
    rcv_next: u32,
    /// Fixed slot set; no dynamic growth.
    slots: [Option<Slot>; MAX_BUFFER_PACKETS],
    available: u16,
}

impl RecvWindow {
    pub fn new() -> Self {
        RecvWindow {
            rcv_next: 1,
            slots: Default::default(),
            available: RECEIVER_BUFFER_SIZE,
        }
    }

    pub fn rcv_next(&self) -> u32 {
        self.rcv_next
    }

    /// Free buffer space, advertised in every outgoing header.
    pub fn window(&self) -> u16 {
        self.available
    }

    /// Accept one data packet. Whatever the outcome, the caller emits an
    /// ACK with `rcv_next` and the current window afterwards.
    pub fn on_data(&mut self, seq: u32, payload: Bytes) -> RecvOutcome {
        if seq == self.rcv_next {
            self.rcv_next = self.rcv_next.wrapping_add(payload.len() as u32);
            let mut delivered = vec![payload];
            delivered.extend(self.drain());

            trace!(seq, rcv_next = self.rcv_next, "in-order delivery");
            return RecvOutcome::Delivered(delivered);
        }

        if seq < self.rcv_next || self.slots.iter().flatten().any(|s| s.seq == seq) {
            return RecvOutcome::Dropped(DropReason::Duplicate);
        }

        if payload.len() > self.available as usize {
            debug!(
                seq,
                len = payload.len(),
                available = self.available,
                "no window space for out-of-order packet"
            );
            return RecvOutcome::Dropped(DropReason::NoSpace);
        }

        let Some(free) = self.slots.iter_mut().find(|s| s.is_none()) else {
            debug!(seq, "all reassembly slots occupied");
            return RecvOutcome::Dropped(DropReason::SlotsFull);
        };

        self.available -= payload.len() as u16;
        *free = Some(Slot { seq, payload });

        trace!(seq, available = self.available, "buffered out of order");
        RecvOutcome::Buffered
    }

    /// Pull every slot that now lines up with `rcv_next`, in stream order.
    /// Called on each in-order advance and once more when a FIN closes the
    /// stream; slots beyond a gap stay unreachable and are simply dropped
    /// with the window.
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut drained = Vec::new();

        loop {
            let Some(idx) = self
                .slots
                .iter()
                .position(|s| s.as_ref().is_some_and(|s| s.seq == self.rcv_next))
            else {
                break;
            };

            let slot = self.slots[idx].take().unwrap();
            self.available += slot.payload.len() as u16;
            self.rcv_next = self.rcv_next.wrapping_add(slot.payload.len() as u32);

            trace!(seq = slot.seq, rcv_next = self.rcv_next, "drained slot");
            drained.push(slot.payload);
        }

        drained
    }

    #[cfg(test)]
    fn buffer_used(&self) -> u16 {
        self.slots
            .iter()
            .flatten()
            .map(|s| s.payload.len() as u16)
            .sum()
    }
}

impl Default for RecvWindow {
    fn default() -> Self {
        Self::new()
    }
}
