//! Frame fragmentation and reassembly for the lossy data channel
//!
//! One compressed frame travels as many bounded datagrams. [`fragment`] slices
//! a blob into [`Packet`]s tagged with a fresh random salt; [`Reassembler`]
//! groups received packets by salt and yields each blob once every index has
//! arrived. Loss, duplication, reordering and interleaving of frames are all
//! tolerated; a frame is delivered whole or not at all.

mod packet;

pub use packet::{Packet, PacketTrailer, MAX_FRAME_PACKETS, MAX_SALT, TRAILER_SIZE};

use bytes::{Bytes, BytesMut};
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Partial assemblies older than this are silently evicted.
pub const ASSEMBLY_TIMEOUT: Duration = Duration::from_millis(500);

/// At most this many frames may be under assembly at once.
pub const MAX_ASSEMBLIES: usize = 8;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("packet size {0} leaves no payload room")]
    PacketSizeTooSmall(usize),

    #[error("blob of {bytes} bytes needs {packets} packets, limit is {MAX_FRAME_PACKETS}")]
    FrameTooLarge { bytes: usize, packets: usize },

    #[error("packet for salt {salt} expects {got} packets, assembly expects {expected}")]
    InconsistentFrame { salt: u16, expected: u16, got: u16 },
}

/// Fragments a blob into wire packets of at most `max_packet_size` bytes.
///
/// Every call draws a fresh salt, so retransmitting the same blob produces a
/// distinct frame on the wire. An empty blob yields one empty-payload packet.
pub fn fragment(blob: Bytes, max_packet_size: usize) -> Result<Vec<Packet>, CodecError> {
    let payload_size = max_packet_size.saturating_sub(TRAILER_SIZE);
    if payload_size == 0 {
        return Err(CodecError::PacketSizeTooSmall(max_packet_size));
    }

    let total = if blob.is_empty() {
        1
    } else {
        (blob.len() + payload_size - 1) / payload_size
    };

    if total > MAX_FRAME_PACKETS {
        return Err(CodecError::FrameTooLarge {
            bytes: blob.len(),
            packets: total,
        });
    }

    let salt = rand::thread_rng().gen_range(0..=MAX_SALT);

    let mut packets = Vec::with_capacity(total);
    for index in 0..total {
        let start = index * payload_size;
        let end = (start + payload_size).min(blob.len());
        packets.push(Packet::new(
            PacketTrailer {
                salt,
                total: total as u16,
                index: index as u16,
            },
            blob.slice(start..end),
        ));
    }

    Ok(packets)
}

/// One frame under assembly.
struct Assembly {
    total: u16,
    parts: Vec<Option<Bytes>>,
    received: usize,
    started: Instant,
}

impl Assembly {
    fn new(total: u16) -> Self {
        Self {
            total,
            parts: vec![None; total as usize],
            received: 0,
            started: Instant::now(),
        }
    }

    fn insert(&mut self, index: u16, payload: Bytes) {
        let slot = &mut self.parts[index as usize];
        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(payload);
    }

    fn is_complete(&self) -> bool {
        self.received == self.total as usize
    }

    fn into_blob(self) -> Bytes {
        let size = self
            .parts
            .iter()
            .map(|p| p.as_ref().map_or(0, Bytes::len))
            .sum();
        let mut blob = BytesMut::with_capacity(size);
        for part in self.parts {
            blob.extend_from_slice(&part.expect("complete assembly has every part"));
        }
        blob.freeze()
    }
}

/// Stateful stream transformer turning packets back into blobs.
///
/// Distinct frames may interleave freely; the salt keeps them apart. State is
/// bounded: partials idle past the timeout are dropped, and when more than
/// `max_assemblies` frames are in flight the oldest-started partial is
/// evicted.
pub struct Reassembler {
    assemblies: HashMap<u16, Assembly>,
    max_assemblies: usize,
    timeout: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_limits(MAX_ASSEMBLIES, ASSEMBLY_TIMEOUT)
    }

    pub fn with_limits(max_assemblies: usize, timeout: Duration) -> Self {
        Self {
            assemblies: HashMap::new(),
            max_assemblies,
            timeout,
        }
    }

    /// Feeds one packet; returns the reassembled blob once a frame completes.
    ///
    /// `InconsistentFrame` reports a packet whose total disagreed with an
    /// existing partial for the same salt. The partial has already been
    /// dropped and the offending packet starts a new assembly, so the caller
    /// just logs and keeps feeding.
    pub fn push(&mut self, packet: Packet) -> Result<Option<Bytes>, CodecError> {
        self.evict_idle();

        let PacketTrailer { salt, total, index } = packet.trailer;

        let mut conflict = None;
        if let Some(assembly) = self.assemblies.get(&salt) {
            if assembly.total != total {
                let expected = assembly.total;
                warn!(salt, expected, got = total, "inconsistent frame, dropping partial assembly");
                self.assemblies.remove(&salt);
                conflict = Some(CodecError::InconsistentFrame {
                    salt,
                    expected,
                    got: total,
                });
            }
        }

        let assembly = self.assemblies.entry(salt).or_insert_with(|| Assembly::new(total));
        assembly.insert(index, packet.payload);

        if assembly.is_complete() {
            let assembly = self
                .assemblies
                .remove(&salt)
                .expect("assembly present, it was just inserted");
            debug!(salt, packets = total, "frame reassembled");
            return Ok(Some(assembly.into_blob()));
        }

        self.evict_overflow();

        match conflict {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }

    /// Number of frames currently under assembly.
    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }

    /// Drops all partial state.
    pub fn clear(&mut self) {
        self.assemblies.clear();
    }

    fn evict_idle(&mut self) {
        let timeout = self.timeout;
        self.assemblies.retain(|salt, assembly| {
            let keep = assembly.started.elapsed() <= timeout;
            if !keep {
                debug!(salt, "evicting idle partial assembly");
            }
            keep
        });
    }

    fn evict_overflow(&mut self) {
        while self.assemblies.len() > self.max_assemblies {
            let oldest = self
                .assemblies
                .iter()
                .min_by_key(|(_, a)| a.started)
                .map(|(salt, _)| *salt)
                .expect("non-empty map has a minimum");
            debug!(salt = oldest, "evicting oldest partial assembly");
            self.assemblies.remove(&oldest);
        }
    }
}
