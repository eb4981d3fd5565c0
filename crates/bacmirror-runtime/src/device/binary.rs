use super::expect_single_object;
use crate::config::DeviceConfig;
use crate::{DeviceKind, RuntimeError};
use bacmirror_core::{ObjectType, PropertyId};

const BINARY_METADATA: &[PropertyId] = &[PropertyId::ObjectName, PropertyId::Description];
const BINARY_LIVE: &[PropertyId] = &[PropertyId::PresentValue];

/// A sensed binary point. Live values arrive via COV.
pub struct BinaryInput;

impl BinaryInput {
    pub fn from_config(config: &DeviceConfig) -> Result<Self, RuntimeError> {
        expect_single_object(config, ObjectType::BinaryInput, "binary-input")?;
        Ok(Self)
    }
}

impl DeviceKind for BinaryInput {
    fn kind_name(&self) -> &'static str {
        "binary-input"
    }

    fn uses_cov(&self) -> bool {
        true
    }

    fn metadata_properties(&self) -> &'static [PropertyId] {
        BINARY_METADATA
    }

    fn live_properties(&self) -> &'static [PropertyId] {
        BINARY_LIVE
    }
}

/// A writable binary value. Live values arrive via COV.
pub struct BinaryValue;

impl BinaryValue {
    pub fn from_config(config: &DeviceConfig) -> Result<Self, RuntimeError> {
        expect_single_object(config, ObjectType::BinaryValue, "binary-value")?;
        Ok(Self)
    }
}

impl DeviceKind for BinaryValue {
    fn kind_name(&self) -> &'static str {
        "binary-value"
    }

    fn uses_cov(&self) -> bool {
        true
    }

    fn metadata_properties(&self) -> &'static [PropertyId] {
        BINARY_METADATA
    }

    fn live_properties(&self) -> &'static [PropertyId] {
        BINARY_LIVE
    }
}
