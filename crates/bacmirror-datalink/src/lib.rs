//! Transport layer for the bacmirror runtime.
//!
//! One UDP socket per logical connection, shared by every output channel.
//! All outbound traffic is serialized through the [`SequenceCoordinator`],
//! which bounds in-flight sends per destination and paces admissions; the
//! [`SocketListener`] republishes every inbound datagram as a [`RawEvent`]
//! carrying a reply-capable [`OutputChannel`]. Nothing in this crate
//! decodes protocol bytes.

pub mod address;
pub mod channel;
pub mod error;
pub mod listener;
pub mod sequencer;
pub mod transport;

pub use address::{broadcast_addr, DEFAULT_PORT};
pub use channel::OutputChannel;
pub use error::LinkError;
pub use listener::{ListenInfo, RawEvent, SocketListener};
pub use sequencer::{SendJob, SequenceCoordinator};
pub use transport::{UdpTransport, MAX_FRAME_LEN};
