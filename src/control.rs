//! Control-channel endpoint
//!
//! A reliable TCP byte stream carrying fixed-width 13-byte angle records:
//!
//! ```text
//! "SDDD.DD SDDD.DD"
//! ```
//!
//! Each half is one gimbal angle, signed, zero-padded to width 6 with two
//! decimals. Records are self-delimiting by width; senders may coalesce, so
//! receivers always parse the **last 13 bytes** of whatever a read returned
//! and treat earlier records in the same chunk as stale.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::SOCKET_TIMEOUT;

/// Wire size of one angle record.
pub const RECORD_SIZE: usize = 13;

/// End-of-session hint a consumer may send just before closing.
pub const END_HINT: &[u8] = b"end end";

/// Pan/tilt set-point in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GimbalAngles {
    pub x: f64,
    pub y: f64,
}

impl GimbalAngles {
    pub const X_MIN: f64 = -90.0;
    pub const X_MAX: f64 = 90.0;
    pub const Y_MIN: f64 = -90.0;
    pub const Y_MAX: f64 = 40.0;

    /// Neutral position the gimbal returns to between sessions.
    pub const CENTER: Self = Self { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }.clamped()
    }

    /// Clamps both axes into their mechanical ranges.
    pub fn clamped(self) -> Self {
        Self {
            x: self.x.clamp(Self::X_MIN, Self::X_MAX),
            y: self.y.clamp(Self::Y_MIN, Self::Y_MAX),
        }
    }

    /// Equality at wire resolution (two decimal places).
    pub fn same_record(&self, other: &Self) -> bool {
        (self.x - other.x).abs() < 0.005 && (self.y - other.y).abs() < 0.005
    }
}

impl fmt::Display for GimbalAngles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2})", self.x, self.y)
    }
}

/// Shared angle cell: one writer, one reader, plus a change flag so the
/// producer can send only when the applied angles moved.
#[derive(Debug)]
pub struct AngleState {
    current: Mutex<GimbalAngles>,
    changed: AtomicBool,
}

impl AngleState {
    pub fn new(initial: GimbalAngles) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(initial),
            changed: AtomicBool::new(false),
        })
    }

    pub fn get(&self) -> GimbalAngles {
        *self.current.lock().unwrap()
    }

    pub fn set(&self, angles: GimbalAngles) {
        *self.current.lock().unwrap() = angles;
        self.changed.store(true, Ordering::Release);
    }

    /// Returns the current angles if they changed since the last take.
    pub fn take_changed(&self) -> Option<GimbalAngles> {
        if self.changed.swap(false, Ordering::AcqRel) {
            Some(self.get())
        } else {
            None
        }
    }
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control channel down: {0}")]
    ChannelDown(#[from] io::Error),

    #[error("malformed control record: {0}")]
    Protocol(String),

    #[error("control channel closed by peer")]
    Closed,

    #[error("control socket operation timed out")]
    Timeout,
}

/// What one receive produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlMessage {
    /// Freshest angle record in the received chunk.
    Angles(GimbalAngles),

    /// The peer announced it is about to close.
    EndOfSession,
}

/// Formats one 13-byte wire record.
pub fn format_record(angles: GimbalAngles) -> [u8; RECORD_SIZE] {
    let text = format!("{:06.2} {:06.2}", angles.x, angles.y);
    debug_assert_eq!(text.len(), RECORD_SIZE);

    let mut record = [0u8; RECORD_SIZE];
    record.copy_from_slice(text.as_bytes());
    record
}

/// Parses the trailing record of a received chunk.
pub fn parse_record(chunk: &[u8]) -> Result<GimbalAngles, ControlError> {
    if chunk.len() < RECORD_SIZE {
        return Err(ControlError::Protocol(format!(
            "chunk of {} bytes holds no full record",
            chunk.len()
        )));
    }

    let tail = &chunk[chunk.len() - RECORD_SIZE..];
    let text = std::str::from_utf8(tail)
        .map_err(|_| ControlError::Protocol("record is not ASCII".into()))?;

    let mut halves = text.split_whitespace();
    let x = parse_angle(halves.next(), text)?;
    let y = parse_angle(halves.next(), text)?;
    if halves.next().is_some() {
        return Err(ControlError::Protocol(format!("extra field in {text:?}")));
    }

    Ok(GimbalAngles { x, y })
}

fn parse_angle(half: Option<&str>, record: &str) -> Result<f64, ControlError> {
    half.and_then(|h| h.parse().ok())
        .ok_or_else(|| ControlError::Protocol(format!("bad angle in {record:?}")))
}

/// Listening side of the control channel (producer).
pub struct ControlListener {
    listener: TcpListener,
}

impl ControlListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ControlError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "control channel listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ControlError> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until a peer connects; one session has one control peer.
    pub async fn accept(&self) -> Result<ControlChannel, ControlError> {
        let (stream, peer) = self.listener.accept().await?;
        info!(%peer, "control channel open");
        Ok(ControlChannel { stream })
    }
}

/// One established control connection.
pub struct ControlChannel {
    stream: TcpStream,
}

impl ControlChannel {
    /// Connecting side (consumer).
    pub async fn connect(addr: SocketAddr) -> Result<Self, ControlError> {
        let stream = timeout(SOCKET_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ControlError::Timeout)??;
        info!(peer = %addr, "control channel open");
        Ok(Self { stream })
    }

    /// Splits into independently-owned send and receive halves, one per
    /// pipeline activity.
    pub fn split(self) -> (ControlSender, ControlReceiver) {
        let (read, write) = self.stream.into_split();
        (
            ControlSender {
                writer: write,
                closed: false,
            },
            ControlReceiver {
                reader: read,
                pending: Vec::new(),
            },
        )
    }
}

/// Write half of the control channel.
pub struct ControlSender {
    writer: OwnedWriteHalf,
    closed: bool,
}

impl ControlSender {
    /// Writes one angle record.
    pub async fn send(&mut self, angles: GimbalAngles) -> Result<(), ControlError> {
        let record = format_record(angles);
        timeout(SOCKET_TIMEOUT, self.writer.write_all(&record))
            .await
            .map_err(|_| ControlError::Timeout)??;
        Ok(())
    }

    /// Sends the end-of-session hint. Best effort; errors are discarded since
    /// the channel is being torn down anyway.
    pub async fn send_end_hint(&mut self) {
        let _ = timeout(SOCKET_TIMEOUT, self.writer.write_all(END_HINT)).await;
    }

    /// Idempotent shutdown of the write direction.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.writer.shutdown().await;
            debug!("control sender closed");
        }
    }
}

/// Read half of the control channel.
pub struct ControlReceiver {
    reader: OwnedReadHalf,
    pending: Vec<u8>,
}

impl ControlReceiver {
    /// Reads until a full record (or the end hint) is available and returns
    /// the freshest content.
    ///
    /// A malformed record is a protocol violation: the caller must close the
    /// channel and reset the session.
    pub async fn recv(&mut self) -> Result<ControlMessage, ControlError> {
        loop {
            let mut chunk = [0u8; 1024];
            let n = timeout(SOCKET_TIMEOUT, self.reader.read(&mut chunk))
                .await
                .map_err(|_| ControlError::Timeout)??;
            if n == 0 {
                return Err(ControlError::Closed);
            }
            self.pending.extend_from_slice(&chunk[..n]);

            if self.pending.ends_with(END_HINT) {
                self.pending.clear();
                return Ok(ControlMessage::EndOfSession);
            }

            if self.pending.len() >= RECORD_SIZE {
                let angles = parse_record(&self.pending)?;
                self.pending.clear();
                return Ok(ControlMessage::Angles(angles));
            }
            // partial record: keep reading
        }
    }
}
