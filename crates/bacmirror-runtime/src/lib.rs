//! Client-side protocol runtime: mirrors remote field devices locally.
//!
//! The runtime turns raw inbound datagrams into filterable event streams
//! ([`FlowRouter`]), serializes and paces outbound requests per
//! destination (via `bacmirror-datalink`), renews change-of-value
//! subscriptions against a centrally ticked lease ([`ServiceCoordinator`]),
//! and drives heartbeat-based liveness with reconnect recovery
//! ([`DeviceActor`]). One [`ConnectionContext`] owns everything a logical
//! connection shares.

pub mod actor;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod heartbeat;
pub mod router;
pub mod services;
pub mod subscriptions;
pub mod testkit;

pub use actor::{DeviceActor, DeviceKind, OperationalStatus, StateChange, StatePublisher};
pub use config::{CovTimerConfig, DeviceConfig, RuntimeConfig, SequenceConfig};
pub use context::ConnectionContext;
pub use error::RuntimeError;
pub use heartbeat::StatusTimer;
pub use router::{DecodeFailure, DecodedEvent, FlowRouter};
pub use services::{ApiService, CovLease, ServiceCoordinator};
pub use subscriptions::{SubscriptionHandle, SubscriptionSet};
