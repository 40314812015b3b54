//! Data-channel packet structure with its ASCII trailer
//!
//! Every datagram on the data channel carries a payload slice followed by a
//! fixed 9-byte trailer:
//!
//! ```text
//! | payload (P bytes) | salt (3 digits) | total-1 (3 digits) | index (3 digits) |
//! ```
//!
//! All packets of one frame share the same salt and total; the index orders
//! the payload slices.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the ASCII trailer appended to every packet.
pub const TRAILER_SIZE: usize = 9;

/// Largest salt value expressible in three decimal digits.
pub const MAX_SALT: u16 = 999;

/// Largest number of packets one frame may span.
pub const MAX_FRAME_PACKETS: usize = 1000;

/// Parsed packet trailer.
///
/// `total` is the packet count of the frame (the wire carries `total - 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketTrailer {
    /// Per-frame random tag grouping packets of one frame.
    pub salt: u16,

    /// Number of packets in the frame (1..=1000).
    pub total: u16,

    /// Zero-based position of this packet within its frame.
    pub index: u16,
}

impl PacketTrailer {
    /// Parses a trailer from its 9 wire bytes.
    ///
    /// Returns `None` on non-digit bytes or when `index` falls outside
    /// `[0, total)` — such a packet cannot belong to any well-formed frame.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != TRAILER_SIZE {
            return None;
        }

        let salt = parse_ascii3(&data[0..3])?;
        let total = parse_ascii3(&data[3..6])? + 1;
        let index = parse_ascii3(&data[6..9])?;

        if index >= total {
            return None;
        }

        Some(Self { salt, total, index })
    }

    /// Serializes the trailer to its 9 wire bytes.
    pub fn to_bytes(&self) -> [u8; TRAILER_SIZE] {
        let mut bytes = [0u8; TRAILER_SIZE];
        put_ascii3(&mut bytes[0..3], self.salt);
        put_ascii3(&mut bytes[3..6], self.total - 1);
        put_ascii3(&mut bytes[6..9], self.index);
        bytes
    }
}

/// Complete data-channel packet: payload slice plus trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub trailer: PacketTrailer,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(trailer: PacketTrailer, payload: Bytes) -> Self {
        Self { trailer, payload }
    }

    /// Parses a packet from one received datagram.
    ///
    /// Returns `None` when the datagram is shorter than a trailer or the
    /// trailer does not decode; the caller treats that as data loss.
    pub fn from_bytes(data: Bytes) -> Option<Self> {
        if data.len() < TRAILER_SIZE {
            return None;
        }

        let split = data.len() - TRAILER_SIZE;
        let trailer = PacketTrailer::from_bytes(&data[split..])?;
        let payload = data.slice(..split);

        Some(Self { trailer, payload })
    }

    /// Serializes the packet to datagram bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + TRAILER_SIZE);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.trailer.to_bytes());
        buf.freeze()
    }
}

fn parse_ascii3(digits: &[u8]) -> Option<u16> {
    let mut value = 0u16;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value * 10 + (b - b'0') as u16;
    }
    Some(value)
}

fn put_ascii3(out: &mut [u8], value: u16) {
    debug_assert!(value <= 999);
    out[0] = b'0' + (value / 100) as u8;
    out[1] = b'0' + (value / 10 % 10) as u8;
    out[2] = b'0' + (value % 10) as u8;
}
