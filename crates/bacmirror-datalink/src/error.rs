use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the transport layer.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Binding the UDP endpoint failed. Fatal: reported synchronously at
    /// startup and never retried.
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    /// A single send or receive failed. Surfaced to the caller awaiting
    /// that operation; never halts a destination queue.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Payload exceeds the maximum datagram size.
    #[error("frame too large ({len} > {max} bytes)")]
    FrameTooLarge { len: usize, max: usize },
    /// The sequence coordinator has been shut down.
    #[error("sequence coordinator closed")]
    Closed,
}
