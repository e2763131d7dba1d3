//! The connection: lifecycle state machine and the single-threaded event
//! loop that drives it.
//!
//! ```text
//!          initiator                           responder
//!
//!           CLOSED                               CLOSED
//!             | open(): snd SYN                    |
//!          SYN_SENT    -----------------------\    |
//!             |                                \   | rcv SYN: snd SYN-ACK
//!             | rcv SYN-ACK: snd ACK            \ SYN_RCVD
//!         ESTABLISHED  <------------------------/   | rcv ACK (or first DATA)
//!             |                               ESTABLISHED
//!             | producer EOF: snd FIN              |
//!          FIN_WAIT                                 | rcv FIN: snd ACK, snd FIN
//!             | rcv ACK of FIN                  CLOSE_ACK
//!          FIN_WAIT_2                               | rcv final ACK
//!             | rcv FIN: snd ACK                  CLOSED
//!          TIME_WAIT (no linger)
//!             |
//!           CLOSED
//! ```
//!
//! Every transition happens inside one loop iteration; the only suspension
//! points are the deadline-capped wait and the producer's fetch.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::app::{Fetch, Sink, Source};
use crate::clock::{Clock, Deadline, Millis};
use crate::err::Error;
use crate::io::{DatagramIo, Event, LossPolicy};
use crate::recv::{RecvOutcome, RecvWindow};
use crate::send::SendWindow;
use crate::trace::TraceLog;
use crate::wire::{Flags, Packet};

/// Fixed initial sequence numbers; the data stream runs in its own
/// sequence space starting at 1.
pub const INITIATOR_ISN: u32 = 50;
pub const RESPONDER_ISN: u32 = 100;

const HANDSHAKE_TIMEOUT: Millis = 3000;
const FIN_RETRY_LIMIT: u32 = 5;
const FIN_RETRY_TIMEOUT: Millis = 1000;
/// Wake-up cadence for producer polling while nothing is in flight.
const IDLE_POLL: Millis = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    SynSent,
    SynRcvd,
    Established,
    FinWait,
    FinWait2,
    CloseAck,
    TimeWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// What dispatching one packet decided about the connection's future.
enum Step {
    Continue,
    Finished(Option<String>),
}

pub struct Connection {
    role: Role,
    state: State,
    peer: SocketAddr,
    io: DatagramIo,
    clock: Clock,
    trace: TraceLog,
    send: SendWindow,
    recv: RecvWindow,
    /// Payload fetched from the producer but refused by the window;
    /// retried before anything new is fetched.
    staged: Option<Vec<u8>>,
    /// Digest reported by the sink when the stream closed, kept here so
    /// it survives a teardown that runs out of retries.
    digest: Option<String>,
}

impl Connection {
    /// Active open: send SYN, wait up to three seconds for the SYN-ACK,
    /// confirm it. Returns an established connection or
    /// [`Error::HandshakeTimeout`].
    pub fn open(io: DatagramIo, peer: SocketAddr, trace: TraceLog) -> Result<Self, Error> {
        let mut conn = Connection::idle(Role::Initiator, peer, io, trace);

        let syn = Packet::control(Flags::SYN, INITIATOR_ISN, 0, conn.recv.window());
        info!(peer = %conn.peer, "sending SYN");
        conn.io.send(&syn, conn.peer, &mut conn.trace)?;
        conn.state = State::SynSent;

        let deadline = Deadline::after(conn.clock.now(), HANDSHAKE_TIMEOUT);
        loop {
            match conn.io.wait(deadline, &conn.clock, None, &mut conn.trace)? {
                Event::TimedOut => {
                    conn.state = State::Closed;
                    return Err(Error::HandshakeTimeout);
                }
                Event::Datagram(pkt, from) => {
                    let h = pkt.header;
                    if from == conn.peer
                        && h.flags.contains(Flags::SYN | Flags::ACK)
                        && h.ack == INITIATOR_ISN.wrapping_add(1)
                    {
                        let ack = Packet::control(
                            Flags::ACK,
                            INITIATOR_ISN.wrapping_add(1),
                            h.seq.wrapping_add(1),
                            conn.recv.window(),
                        );
                        conn.io.send(&ack, conn.peer, &mut conn.trace)?;
                        conn.send = SendWindow::new(h.window);
                        conn.state = State::Established;
                        info!(peer_window = h.window, "handshake complete");
                        return Ok(conn);
                    }
                }
                Event::Input => {}
            }
        }
    }

    /// Passive open: wait for a SYN, pin its source as the peer, answer
    /// with SYN-ACK. The promotion to ESTABLISHED happens in [`run`] when
    /// the handshake ACK (or the first data packet standing in for a lost
    /// one) arrives.
    ///
    /// [`run`]: Connection::run
    pub fn accept(mut io: DatagramIo, mut trace: TraceLog) -> Result<Self, Error> {
        info!("waiting for SYN");

        let clock = Clock::new();
        loop {
            let deadline = Deadline::after(clock.now(), IDLE_POLL);
            match io.wait(deadline, &clock, None, &mut trace)? {
                Event::TimedOut | Event::Input => continue,
                Event::Datagram(pkt, from) => {
                    let h = pkt.header;
                    if h.flags.contains(Flags::SYN) && !h.flags.contains(Flags::ACK) {
                        let mut conn = Connection::idle(Role::Responder, from, io, trace);
                        conn.clock = clock;

                        let synack = Packet::control(
                            Flags::SYN | Flags::ACK,
                            RESPONDER_ISN,
                            h.seq.wrapping_add(1),
                            conn.recv.window(),
                        );
                        conn.io.send(&synack, conn.peer, &mut conn.trace)?;
                        conn.send = SendWindow::new(h.window);
                        conn.state = State::SynRcvd;
                        info!(peer = %conn.peer, "SYN received, sent SYN-ACK");
                        return Ok(conn);
                    }

                    debug!(%from, "ignoring non-SYN datagram before handshake");
                }
            }
        }
    }

    fn idle(role: Role, peer: SocketAddr, io: DatagramIo, trace: TraceLog) -> Self {
        Connection {
            role,
            state: State::Closed,
            peer,
            io,
            clock: Clock::new(),
            trace,
            send: SendWindow::new(0),
            recv: RecvWindow::new(),
            staged: None,
            digest: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Digest of the received stream, present once the sink has been
    /// finalized, whether or not the teardown completed.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Swap the loss policy under a live connection.
    pub fn set_loss(&mut self, loss: LossPolicy) {
        self.io.set_loss(loss);
    }

    /// Drive the connection until the byte stream ends in either
    /// direction and the teardown completes. Returns the sink's digest
    /// when this side closed on the peer's FIN.
    ///
    /// Each iteration waits on the earliest of the retransmission deadline
    /// and a producer poll, dispatches whatever arrived, retransmits the
    /// oldest segment if its timer expired, and then pumps the producer
    /// until it blocks.
    pub fn run(
        &mut self,
        source: &mut dyn Source,
        sink: &mut dyn Sink,
    ) -> Result<Option<String>, Error> {
        let mut eof = self.pump(source)?;

        loop {
            if eof && self.send.is_empty() && self.state == State::Established {
                self.close_initiated()?;
                return Ok(None);
            }

            let deadline = self
                .send
                .rto_deadline()
                .unwrap_or_else(|| Deadline::after(self.clock.now(), IDLE_POLL));
            let input = if eof || self.staged.is_some() {
                None
            } else {
                source.poll_fd()
            };

            match self.io.wait(deadline, &self.clock, input, &mut self.trace)? {
                Event::Datagram(pkt, from) => {
                    if from != self.peer {
                        debug!(%from, "discarding datagram from unexpected address");
                    } else if let Step::Finished(digest) = self.dispatch(pkt, sink)? {
                        return Ok(digest);
                    }
                }
                Event::Input | Event::TimedOut => {}
            }

            let now = self.clock.now();
            if let Some(seg) = self.send.due_retransmit(now) {
                self.trace.timeout(seg.seq());
                warn!(seq = seg.seq(), "RTO expired, retransmitting");
                self.io.send_segment(seg, self.peer, true, &mut self.trace)?;
            }

            if !eof {
                eof = self.pump(source)?;
            }
        }
    }

    /// Feed producer payloads into the send window until the producer has
    /// nothing or the window refuses. Returns true on producer EOF.
    fn pump(&mut self, source: &mut dyn Source) -> Result<bool, Error> {
        if self.state != State::Established {
            return Ok(false);
        }

        loop {
            let payload = match self.staged.take() {
                Some(p) => p,
                None => match source.fetch()? {
                    Fetch::Ready(p) => p,
                    Fetch::Idle => return Ok(false),
                    Fetch::Done => {
                        info!("producer stream ended");
                        return Ok(true);
                    }
                },
            };

            let now = self.clock.now();
            let ack = self.recv.rcv_next();
            let window = self.recv.window();
            match self.send.try_enqueue(&payload, ack, window, now) {
                Ok(seg) => self.io.send_segment(seg, self.peer, false, &mut self.trace)?,
                Err(reason) => {
                    debug!(?reason, "producer paused");
                    self.staged = Some(payload);
                    return Ok(false);
                }
            }
        }
    }

    fn dispatch(&mut self, pkt: Packet, sink: &mut dyn Sink) -> Result<Step, Error> {
        let h = pkt.header;

        match self.state {
            State::SynRcvd => {
                if h.flags.contains(Flags::SYN) {
                    // Duplicate SYN: our SYN-ACK went missing.
                    let synack = Packet::control(
                        Flags::SYN | Flags::ACK,
                        RESPONDER_ISN,
                        h.seq.wrapping_add(1),
                        self.recv.window(),
                    );
                    self.io.send(&synack, self.peer, &mut self.trace)?;
                    return Ok(Step::Continue);
                }

                if h.flags.contains(Flags::FIN) {
                    // Empty stream: the peer established and closed before
                    // we saw its handshake ACK.
                    self.established();
                    return self.close_on_fin(h.seq, sink).map(Step::Finished);
                }

                if h.flags.contains(Flags::ACK) && h.ack == RESPONDER_ISN.wrapping_add(1) {
                    self.established();
                    return Ok(Step::Continue);
                }

                if !pkt.payload.is_empty() {
                    // Data implies the peer's handshake completed; its ACK
                    // was lost on the way here.
                    self.established();
                    self.handle_data(pkt, sink)?;
                }

                Ok(Step::Continue)
            }

            State::Established => {
                if h.flags.contains(Flags::SYN) {
                    if self.role == Role::Initiator && h.flags.contains(Flags::ACK) {
                        // Duplicate SYN-ACK: our handshake ACK went missing.
                        let ack = Packet::control(
                            Flags::ACK,
                            INITIATOR_ISN.wrapping_add(1),
                            h.seq.wrapping_add(1),
                            self.recv.window(),
                        );
                        self.io.send(&ack, self.peer, &mut self.trace)?;
                    }
                    return Ok(Step::Continue);
                }

                if h.flags.contains(Flags::FIN) {
                    return self.close_on_fin(h.seq, sink).map(Step::Finished);
                }

                if h.flags.contains(Flags::ACK) && pkt.payload.is_empty() {
                    let now = self.clock.now();
                    self.send.on_ack(h.ack, h.window, now);
                    return Ok(Step::Continue);
                }

                if !pkt.payload.is_empty() {
                    self.handle_data(pkt, sink)?;
                }

                Ok(Step::Continue)
            }

            // Teardown states run their own receive loops; anything that
            // still lands here is stale.
            _ => Ok(Step::Continue),
        }
    }

    fn established(&mut self) {
        self.state = State::Established;
        info!(role = ?self.role, "connection established");
    }

    /// Reassemble one data packet and acknowledge it. The ACK always goes
    /// out, whatever the window decided, carrying the cumulative
    /// `rcv_next` and the current free buffer space.
    fn handle_data(&mut self, pkt: Packet, sink: &mut dyn Sink) -> Result<(), Error> {
        let seq = pkt.header.seq;

        match self.recv.on_data(seq, pkt.payload) {
            RecvOutcome::Delivered(chunks) => {
                for chunk in &chunks {
                    sink.deliver(chunk)?;
                }
            }
            RecvOutcome::Buffered => {}
            RecvOutcome::Dropped(reason) => {
                debug!(seq, ?reason, "data packet not accepted");
            }
        }

        let ack = Packet::control(
            Flags::ACK,
            self.send.next_seq(),
            self.recv.rcv_next(),
            self.recv.window(),
        );
        self.io.send(&ack, self.peer, &mut self.trace)
    }

    /// Active close: the producer is exhausted and every data segment is
    /// acknowledged. Send FIN and retry it until the peer's ACK and FIN
    /// both came back or the retry budget runs out.
    fn close_initiated(&mut self) -> Result<(), Error> {
        let fin_seq = self.send.next_seq();
        let fin = Packet::control(Flags::FIN, fin_seq, self.recv.rcv_next(), self.recv.window());

        info!(seq = fin_seq, "stream complete, sending FIN");
        self.io.send(&fin, self.peer, &mut self.trace)?;
        self.state = State::FinWait;

        let mut retries = 0;
        loop {
            let deadline = Deadline::after(self.clock.now(), FIN_RETRY_TIMEOUT);
            loop {
                match self.io.wait(deadline, &self.clock, None, &mut self.trace)? {
                    Event::TimedOut => break,
                    Event::Input => {}
                    Event::Datagram(pkt, from) => {
                        if from != self.peer {
                            continue;
                        }
                        let h = pkt.header;

                        if h.flags.contains(Flags::FIN) {
                            // Possibly combined with the ACK of our FIN;
                            // either way the teardown is complete on the
                            // peer's side once we acknowledge.
                            let ack = Packet::control(
                                Flags::ACK,
                                fin_seq.wrapping_add(1),
                                h.seq.wrapping_add(1),
                                self.recv.window(),
                            );
                            self.io.send(&ack, self.peer, &mut self.trace)?;
                            // TIME_WAIT does not linger in this profile.
                            self.state = State::Closed;
                            info!("connection closed");
                            return Ok(());
                        }

                        if self.state == State::FinWait
                            && h.flags.contains(Flags::ACK)
                            && h.ack == fin_seq.wrapping_add(1)
                        {
                            debug!("FIN acknowledged, awaiting peer FIN");
                            self.state = State::FinWait2;
                        }
                    }
                }
            }

            if retries == FIN_RETRY_LIMIT {
                self.state = State::Closed;
                return Err(Error::CloseTimeout(FIN_RETRY_LIMIT));
            }
            retries += 1;
            self.trace.timeout(fin_seq);
            warn!(retries, "teardown timed out, retransmitting FIN");
            self.io.send(&fin, self.peer, &mut self.trace)?;
        }
    }

    /// Passive close, entered on the peer's FIN: flush what the stream
    /// can still deliver, finalize the sink, acknowledge, send our own
    /// FIN, and retry it until the final ACK lands.
    fn close_on_fin(
        &mut self,
        peer_fin_seq: u32,
        sink: &mut dyn Sink,
    ) -> Result<Option<String>, Error> {
        info!(seq = peer_fin_seq, "FIN received, closing stream");

        // Buffered segments beyond a gap are unreachable now; only the
        // in-order prefix still reaches the consumer.
        for chunk in self.recv.drain() {
            sink.deliver(&chunk)?;
        }
        let digest = sink.finish()?;
        self.digest.clone_from(&digest);

        let fin_ack = Packet::control(
            Flags::ACK,
            self.send.next_seq(),
            peer_fin_seq.wrapping_add(1),
            self.recv.window(),
        );
        self.io.send(&fin_ack, self.peer, &mut self.trace)?;

        let fin_seq = self.recv.rcv_next();
        let fin = Packet::control(
            Flags::FIN,
            fin_seq,
            peer_fin_seq.wrapping_add(1),
            self.recv.window(),
        );
        self.io.send(&fin, self.peer, &mut self.trace)?;
        self.state = State::CloseAck;

        let mut retries = 0;
        loop {
            let deadline = Deadline::after(self.clock.now(), FIN_RETRY_TIMEOUT);
            loop {
                match self.io.wait(deadline, &self.clock, None, &mut self.trace)? {
                    Event::TimedOut => break,
                    Event::Input => {}
                    Event::Datagram(pkt, from) => {
                        if from != self.peer {
                            continue;
                        }
                        let h = pkt.header;

                        if h.flags.contains(Flags::FIN) {
                            // Our ACK of the peer's FIN was lost.
                            self.io.send(&fin_ack, self.peer, &mut self.trace)?;
                            continue;
                        }

                        if h.flags.contains(Flags::ACK) && h.ack == fin_seq.wrapping_add(1) {
                            self.state = State::Closed;
                            info!("connection closed");
                            return Ok(digest);
                        }
                    }
                }
            }

            if retries == FIN_RETRY_LIMIT {
                self.state = State::Closed;
                return Err(Error::CloseTimeout(FIN_RETRY_LIMIT));
            }
            retries += 1;
            self.trace.timeout(fin_seq);
            warn!(retries, "final ACK missing, retransmitting FIN");
            self.io.send(&fin, self.peer, &mut self.trace)?;
        }
    }
}
