use bacmirror_core::{DecodeError, EncodeError};
use bacmirror_datalink::LinkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("encode error: {0}")]
    Encode(EncodeError),
    #[error("decode error: {0}")]
    Decode(DecodeError),
    #[error("correlation wait timed out")]
    Timeout,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<EncodeError> for RuntimeError {
    fn from(err: EncodeError) -> Self {
        Self::Encode(err)
    }
}

impl From<DecodeError> for RuntimeError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}
