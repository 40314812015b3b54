//! Live gimbal-camera streaming over a best-effort IP network
//!
//! One producer owns a camera and a 2-axis servo gimbal; one consumer renders
//! the video and steers the gimbal by dragging a pointer over it. The two are
//! joined by a session of paired channels: a reliable TCP control channel
//! carrying fixed-width angle records, and a lossy UDP data channel carrying
//! compressed frames fragmented into bounded datagrams.
//!
//! Frames are delivered whole or not at all: each frame's packets share a
//! random salt, the consumer reassembles by salt and index, and anything
//! incomplete is eventually dropped. Both channels live and die together
//! under a session supervisor.
//!
//! # Example
//!
//! ```no_run
//! use gimbalcam::codec;
//! use bytes::Bytes;
//!
//! let packets = codec::fragment(Bytes::from_static(b"frame bytes"), 1024)?;
//! let mut reassembler = codec::Reassembler::new();
//! for packet in packets {
//!     if let Some(blob) = reassembler.push(packet)? {
//!         assert_eq!(&blob[..], b"frame bytes");
//!     }
//! }
//! # Ok::<(), gimbalcam::codec::CodecError>(())
//! ```

use std::time::Duration;

pub mod buffer;
pub mod codec;
pub mod compress;
pub mod config;
pub mod consumer;
pub mod control;
pub mod data;
pub mod device;
pub mod producer;
pub mod session;
pub mod stats;

// Re-exports for convenience
pub use buffer::FrameBuffer;
pub use codec::{fragment, Packet, Reassembler};
pub use config::Config;
pub use control::GimbalAngles;
pub use session::{ConsumerSupervisor, ProducerSupervisor, SessionState};

/// Upper bound on any blocking socket operation.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);
