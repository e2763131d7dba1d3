//! SHAM: a reliable, connection-oriented byte stream over UDP datagrams.
//!
//! The crate is a single protocol endpoint. [`Connection::open`] performs
//! the active side of the three-way handshake, [`Connection::accept`] the
//! passive side, and [`Connection::run`] drives data transfer with
//! sliding-window retransmission, adaptive RTO, receiver-advertised flow
//! control, out-of-order reassembly, and a retried four-way close.
//!
//! Byte streams enter and leave through the [`Source`] and [`Sink`]
//! capability traits, so the same endpoint serves keyboard chat and file
//! transfer; the binaries wire up the concrete adapters.

mod err;
pub use err::*;

pub mod app;
pub mod clock;
pub mod conn;
pub mod io;
pub mod recv;
pub mod send;
pub mod trace;
pub mod wire;

pub use app::{Sink, Source};
pub use conn::{Connection, Role, State};
pub use io::{DatagramIo, LossPolicy};
pub use trace::TraceLog;
