//! Packet encoding and decoding.
//!
//! Every datagram carries a fixed 12-byte header followed by up to 1024
//! payload bytes. All multibyte fields are big endian:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Acknowledgment Number                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             Flags             |          Window Size          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The payload length is implied by the datagram length; there is no
//! length field on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::err::Error;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 12;

/// Largest payload a single packet may carry.
pub const MAX_PAYLOAD: usize = 1024;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u16 {
        const SYN = 0x1;
        const ACK = 0x2;
        const FIN = 0x4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Byte offset of the first payload byte. Control packets carry the
    /// sender's current offset.
    pub seq: u32,
    /// Next byte the sender of this packet expects to receive. Meaningful
    /// only when the ACK flag is set.
    pub ack: u32,
    pub flags: Flags,
    /// Bytes currently free in the sender's receive buffer.
    pub window: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    /// A payload-less packet carrying only flags.
    pub fn control(flags: Flags, seq: u32, ack: u32, window: u16) -> Self {
        Packet {
            header: Header {
                seq,
                ack,
                flags,
                window,
            },
            payload: Bytes::new(),
        }
    }

    /// A data packet. The flag field stays empty; acknowledgments travel
    /// in dedicated ACK packets.
    pub fn data(seq: u32, ack: u32, window: u16, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);

        Packet {
            header: Header {
                seq,
                ack,
                flags: Flags::empty(),
                window,
            },
            payload,
        }
    }

    /// Serialize header and payload into a single wire frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());

        buf.put_u32(self.header.seq);
        buf.put_u32(self.header.ack);
        buf.put_u16(self.header.flags.bits());
        buf.put_u16(self.header.window);
        buf.extend_from_slice(&self.payload);

        buf.freeze()
    }

    /// Parse one datagram. Fails with `MalformedFrame` when the datagram
    /// cannot hold a header and `OversizedPayload` when the trailing bytes
    /// exceed [`MAX_PAYLOAD`].
    pub fn decode(datagram: &[u8]) -> Result<Self, Error> {
        if datagram.len() < HEADER_LEN {
            return Err(Error::MalformedFrame(datagram.len()));
        }

        let payload_len = datagram.len() - HEADER_LEN;
        if payload_len > MAX_PAYLOAD {
            return Err(Error::OversizedPayload(payload_len));
        }

        let mut buf = datagram;
        let seq = buf.get_u32();
        let ack = buf.get_u32();
        let flags = Flags::from_bits_truncate(buf.get_u16());
        let window = buf.get_u16();

        Ok(Packet {
            header: Header {
                seq,
                ack,
                flags,
                window,
            },
            payload: Bytes::copy_from_slice(buf),
        })
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Wire-event label used by the trace file.
    pub fn kind(&self) -> &'static str {
        let f = self.header.flags;

        if f.contains(Flags::SYN | Flags::ACK) {
            "SYN-ACK"
        } else if f.contains(Flags::SYN) {
            "SYN"
        } else if f.contains(Flags::FIN) {
            "FIN"
        } else if f.contains(Flags::ACK) && self.payload.is_empty() {
            "ACK"
        } else {
            "DATA"
        }
    }
}
