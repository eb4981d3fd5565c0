//! Protocol vocabulary and codec boundary for the bacmirror runtime.
//!
//! `bacmirror-core` defines the typed view of the wire protocol that the
//! runtime works with: object and property identifiers, property values,
//! the decoded-layer projection, and the [`Codec`] trait through which an
//! external encoder/decoder is injected. The byte-level grammar itself
//! lives behind that trait and is never implemented here.
//!
//! # Feature flags
//!
//! - **`serde`** — derives `Serialize`/`Deserialize` on the vocabulary types.

/// Codec boundary: encode service requests, decode inbound datagrams.
pub mod codec;
/// Encode and decode error types surfaced across the codec boundary.
pub mod error;
/// Object identifiers and object types.
pub mod object;
/// Property identifiers, property values, and status flags.
pub mod property;
/// Service kinds, service choices, requests, and the decoded projection.
pub mod service;

pub use codec::Codec;
pub use error::{DecodeError, EncodeError};
pub use object::{ObjectId, ObjectType};
pub use property::{PropertyId, PropertyValue, StatusFlags};
pub use service::{PropertyReport, ProtocolLayer, ServiceKind, ServiceRequest};
