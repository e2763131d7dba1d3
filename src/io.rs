//! Datagram transport: a UDP socket behind a best-effort send, a
//! deadline-capped receive, and the injected loss policy that exercises
//! the protocol under simulated drops.

use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use nix::poll::{poll, PollFd, PollFlags};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::clock::{Clock, Deadline};
use crate::err::Error;
use crate::send::Segment;
use crate::trace::TraceLog;
use crate::wire::{Packet, HEADER_LEN, MAX_PAYLOAD};

/// Probabilistic drop decision applied to every outgoing datagram, so a
/// single endpoint can exercise loss on everything it puts on the wire.
/// A dropped send still reports success; only the trace file sees it.
#[derive(Debug)]
pub struct LossPolicy {
    rate: f64,
    rng: StdRng,
}

impl LossPolicy {
    pub fn off() -> Self {
        Self::new(0.0)
    }

    pub fn new(rate: f64) -> Self {
        LossPolicy {
            rate,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic variant for tests.
    pub fn seeded(rate: f64, seed: u64) -> Self {
        LossPolicy {
            rate,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn should_drop(&mut self) -> bool {
        self.rate > 0.0 && self.rng.gen::<f64>() < self.rate
    }
}

/// What a deadline-capped wait produced.
#[derive(Debug)]
pub enum Event {
    /// A datagram survived the loss policy and decoded cleanly.
    Datagram(Packet, SocketAddr),
    /// The producer's file descriptor became readable.
    Input,
    TimedOut,
}

#[derive(Debug)]
pub struct DatagramIo {
    sock: UdpSocket,
    loss: LossPolicy,
}

impl DatagramIo {
    /// Responder side: bind the well-known port.
    pub fn bind(port: u16, loss: LossPolicy) -> Result<Self, Error> {
        let sock = UdpSocket::bind(("0.0.0.0", port))?;
        Ok(DatagramIo { sock, loss })
    }

    /// Initiator side: any free local port.
    pub fn ephemeral(loss: LossPolicy) -> Result<Self, Error> {
        Self::bind(0, loss)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.sock.local_addr()?)
    }

    /// Best-effort transmission of a control packet. The loss policy may
    /// eat it; that is not an error.
    pub fn send(
        &mut self,
        pkt: &Packet,
        peer: SocketAddr,
        trace: &mut TraceLog,
    ) -> Result<(), Error> {
        if self.loss.should_drop() {
            trace.dropped(pkt);
            return Ok(());
        }

        self.sock.send_to(&pkt.encode(), peer)?;
        trace.snd(pkt);
        Ok(())
    }

    /// Transmit (or retransmit) a queued data segment from its retained
    /// frame.
    pub fn send_segment(
        &mut self,
        seg: &Segment,
        peer: SocketAddr,
        retx: bool,
        trace: &mut TraceLog,
    ) -> Result<(), Error> {
        if self.loss.should_drop() {
            trace.drop_data(seg.seq());
            return Ok(());
        }

        self.sock.send_to(seg.frame(), peer)?;
        if retx {
            trace.retx(seg.seq(), seg.len());
        } else {
            trace.snd_data(seg.seq(), seg.len());
        }
        Ok(())
    }

    /// Raise or clear the drop rate mid-connection. Lets tests hold the
    /// handshake clean and then batter the data phase.
    pub fn set_loss(&mut self, loss: LossPolicy) {
        self.loss = loss;
    }

    /// Wait until a datagram arrives, the optional input descriptor turns
    /// readable, or the deadline passes. Datagrams that fail to decode
    /// consume wait time without producing an event.
    pub fn wait(
        &mut self,
        deadline: Deadline,
        clock: &Clock,
        input: Option<RawFd>,
        trace: &mut TraceLog,
    ) -> Result<Event, Error> {
        let mut buf = [0u8; HEADER_LEN + MAX_PAYLOAD];

        loop {
            let remaining = deadline.remaining(clock.now()).min(i32::MAX as u64) as i32;

            let sock_fd = self.sock.as_raw_fd();
            let mut fds = Vec::with_capacity(2);
            fds.push(PollFd::new(sock_fd, PollFlags::POLLIN));
            if let Some(fd) = input {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }

            if poll(&mut fds, remaining)? == 0 {
                return Ok(Event::TimedOut);
            }

            let sock_ready = fds[0]
                .revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLIN));
            let input_ready = fds.get(1).is_some_and(|fd| {
                fd.revents()
                    .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
            });

            if sock_ready {
                let (n, from) = self.sock.recv_from(&mut buf)?;

                let pkt = match Packet::decode(&buf[..n]) {
                    Ok(pkt) => pkt,
                    Err(err) => {
                        warn!(%from, "discarding undecodable datagram: {err}");
                        continue;
                    }
                };

                trace.rcv(&pkt);
                return Ok(Event::Datagram(pkt, from));
            }

            if input_ready {
                return Ok(Event::Input);
            }
        }
    }
}
