use crate::{DecodeError, EncodeError, ProtocolLayer, ServiceRequest};

/// The injected wire-format encoder/decoder.
///
/// Both directions are pure functions over their inputs: a codec holds no
/// connection state and may be shared freely between the flow router and
/// every request facade. Implementations live outside this workspace
/// (a test codec ships in `bacmirror-runtime::testkit`).
pub trait Codec: Send + Sync {
    /// Serializes one service request into a complete datagram payload.
    fn encode(&self, request: &ServiceRequest) -> Result<Vec<u8>, EncodeError>;

    /// Decodes one inbound datagram into the typed projection.
    fn decode(&self, payload: &[u8]) -> Result<ProtocolLayer, DecodeError>;
}
