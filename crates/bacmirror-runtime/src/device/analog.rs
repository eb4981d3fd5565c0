use super::expect_single_object;
use crate::config::DeviceConfig;
use crate::{DeviceKind, RuntimeError};
use bacmirror_core::{ObjectType, PropertyId};

const ANALOG_METADATA: &[PropertyId] = &[
    PropertyId::ObjectName,
    PropertyId::Description,
    PropertyId::Units,
];
const ANALOG_LIVE: &[PropertyId] = &[PropertyId::PresentValue];

/// A measured analog point. Live values arrive via COV.
pub struct AnalogInput;

impl AnalogInput {
    pub fn from_config(config: &DeviceConfig) -> Result<Self, RuntimeError> {
        expect_single_object(config, ObjectType::AnalogInput, "analog-input")?;
        Ok(Self)
    }
}

impl DeviceKind for AnalogInput {
    fn kind_name(&self) -> &'static str {
        "analog-input"
    }

    fn uses_cov(&self) -> bool {
        true
    }

    fn metadata_properties(&self) -> &'static [PropertyId] {
        ANALOG_METADATA
    }

    fn live_properties(&self) -> &'static [PropertyId] {
        ANALOG_LIVE
    }
}

/// A writable analog value. Live values arrive via COV.
pub struct AnalogValue;

impl AnalogValue {
    pub fn from_config(config: &DeviceConfig) -> Result<Self, RuntimeError> {
        expect_single_object(config, ObjectType::AnalogValue, "analog-value")?;
        Ok(Self)
    }
}

impl DeviceKind for AnalogValue {
    fn kind_name(&self) -> &'static str {
        "analog-value"
    }

    fn uses_cov(&self) -> bool {
        true
    }

    fn metadata_properties(&self) -> &'static [PropertyId] {
        ANALOG_METADATA
    }

    fn live_properties(&self) -> &'static [PropertyId] {
        ANALOG_LIVE
    }
}
