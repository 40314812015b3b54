//! Data-channel endpoint
//!
//! A datagram socket with an in-band rendezvous. The consumer greets the
//! producer's data port with `"Hello Server WWWW HHHH"`, announcing the frame
//! geometry it wants; the producer records the consumer's address and answers
//! `"Hello Client"`. Frame packets then flow producer → consumer.
//!
//! Loss on this channel is expected and never an error; only unrecoverable
//! socket failures take the channel down.

use bytes::Bytes;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::codec::Packet;
use crate::SOCKET_TIMEOUT;

/// Rendezvous request prefix; the greeting carries `WWWW HHHH` after it.
pub const GREETING_PREFIX: &[u8] = b"Hello Server ";

/// Total size of a rendezvous request.
pub const GREETING_SIZE: usize = 22;

/// Rendezvous reply sent by the producer.
pub const GREETING_REPLY: &[u8] = b"Hello Client";

const RECV_BUFFER_SIZE: usize = 65536;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("data channel down: {0}")]
    ChannelDown(#[from] io::Error),

    #[error("data socket operation timed out")]
    Timeout,

    #[error("unexpected rendezvous reply")]
    HandshakeFailed,
}

/// Encodes the 22-byte rendezvous request.
pub fn encode_greeting(width: u32, height: u32) -> [u8; GREETING_SIZE] {
    debug_assert!(width <= 9999 && height <= 9999);
    let text = format!("Hello Server {width:04} {height:04}");

    let mut greeting = [0u8; GREETING_SIZE];
    greeting.copy_from_slice(text.as_bytes());
    greeting
}

/// Parses a rendezvous request, returning the requested `(width, height)`.
pub fn parse_greeting(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() != GREETING_SIZE || !data.starts_with(GREETING_PREFIX) {
        return None;
    }

    let tail = std::str::from_utf8(&data[GREETING_PREFIX.len()..]).ok()?;
    let (w, h) = tail.split_once(' ')?;
    if w.len() != 4 || h.len() != 4 {
        return None;
    }

    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Producer-side data socket awaiting a consumer.
pub struct DataListener {
    socket: Arc<UdpSocket>,
}

impl DataListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, DataError> {
        let socket = UdpSocket::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "data channel listening");
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DataError> {
        Ok(self.socket.local_addr()?)
    }

    /// Waits for a greeting, replies, and returns the established channel
    /// together with the requested frame geometry.
    ///
    /// Stray datagrams are ignored; the socket stays bound across sessions so
    /// the next consumer can rendezvous after a reset.
    pub async fn accept(&self) -> Result<(DataChannel, (u32, u32)), DataError> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;
            match parse_greeting(&buf[..n]) {
                Some((width, height)) => {
                    self.socket.send_to(GREETING_REPLY, peer).await?;
                    info!(%peer, width, height, "data channel established");
                    return Ok((
                        DataChannel {
                            socket: Arc::clone(&self.socket),
                            peer,
                        },
                        (width, height),
                    ));
                }
                None => debug!(%peer, len = n, "ignoring stray datagram during rendezvous"),
            }
        }
    }
}

/// One established data channel to a single remote peer.
pub struct DataChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl DataChannel {
    /// Consumer-side rendezvous: greet the producer and wait for its reply.
    pub async fn rendezvous(
        producer: SocketAddr,
        width: u32,
        height: u32,
    ) -> Result<Self, DataError> {
        let bind_addr: SocketAddr = if producer.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        socket
            .send_to(&encode_greeting(width, height), producer)
            .await?;

        let mut buf = [0u8; 64];
        loop {
            let (n, peer) = timeout(SOCKET_TIMEOUT, socket.recv_from(&mut buf))
                .await
                .map_err(|_| DataError::Timeout)??;
            if peer != producer {
                debug!(%peer, "ignoring datagram from unknown peer");
                continue;
            }
            if &buf[..n] != GREETING_REPLY {
                return Err(DataError::HandshakeFailed);
            }
            info!(peer = %producer, width, height, "data channel established");
            return Ok(Self {
                socket: Arc::new(socket),
                peer,
            });
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Sends one frame's packets in index order.
    ///
    /// Transient delivery failures are dropped silently (the frame is simply
    /// lost); only unrecoverable socket errors surface as `ChannelDown`.
    pub async fn send_packets(&self, packets: &[Packet]) -> Result<usize, DataError> {
        let mut bytes_sent = 0;
        for packet in packets {
            let wire = packet.to_bytes();
            match self.socket.send_to(&wire, self.peer).await {
                Ok(n) => bytes_sent += n,
                Err(e) if is_transient(&e) => {
                    debug!(error = %e, "dropping packet on transient send failure");
                }
                Err(e) => return Err(DataError::ChannelDown(e)),
            }
        }
        Ok(bytes_sent)
    }

    /// Receives one datagram from the established peer.
    pub async fn recv(&self) -> Result<Bytes, DataError> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (n, peer) = timeout(SOCKET_TIMEOUT, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| DataError::Timeout)?
                .map_err(|e| {
                    if is_transient(&e) {
                        DataError::Timeout
                    } else {
                        DataError::ChannelDown(e)
                    }
                })?;
            if peer != self.peer {
                debug!(%peer, "ignoring datagram from unknown peer");
                continue;
            }
            return Ok(Bytes::copy_from_slice(&buf[..n]));
        }
    }
}

/// Loss-like send/receive failures that do not take the channel down.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_roundtrip() {
        let greeting = encode_greeting(800, 600);
        assert_eq!(&greeting, b"Hello Server 0800 0600");
        assert_eq!(greeting.len(), GREETING_SIZE);

        assert_eq!(parse_greeting(&greeting), Some((800, 600)));
    }

    #[test]
    fn test_greeting_large_geometry() {
        let greeting = encode_greeting(1920, 1080);
        assert_eq!(&greeting, b"Hello Server 1920 1080");
        assert_eq!(parse_greeting(&greeting), Some((1920, 1080)));
    }

    #[test]
    fn test_parse_greeting_rejects_malformed() {
        assert!(parse_greeting(b"Hello Server 800 600").is_none());
        assert!(parse_greeting(b"Hello Server 08000600").is_none());
        assert!(parse_greeting(b"Hello Client").is_none());
        assert!(parse_greeting(b"").is_none());
        assert!(parse_greeting(b"Hello Server aaaa bbbb").is_none());
    }
}
