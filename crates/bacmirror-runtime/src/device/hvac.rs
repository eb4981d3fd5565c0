use super::expect_at_least;
use crate::config::DeviceConfig;
use crate::{DeviceKind, RuntimeError};
use bacmirror_core::PropertyId;

const HVAC_METADATA: &[PropertyId] = &[PropertyId::ObjectName, PropertyId::Description];
const HVAC_LIVE: &[PropertyId] = &[PropertyId::PresentValue];

/// A thermostat unit, polled rather than COV-subscribed: many field
/// controllers of this class do not implement COV at all.
pub struct Thermostat;

impl Thermostat {
    pub fn from_config(config: &DeviceConfig) -> Result<Self, RuntimeError> {
        expect_at_least(config, 1, "thermostat")?;
        Ok(Self)
    }
}

impl DeviceKind for Thermostat {
    fn kind_name(&self) -> &'static str {
        "thermostat"
    }

    fn uses_cov(&self) -> bool {
        false
    }

    fn metadata_properties(&self) -> &'static [PropertyId] {
        HVAC_METADATA
    }

    fn live_properties(&self) -> &'static [PropertyId] {
        HVAC_LIVE
    }
}

/// A room controller spanning several objects (temperature, setpoint,
/// fan, ...). All of them must report healthy before the actor declares
/// the unit operational; polled like [`Thermostat`].
pub struct RoomControl;

impl RoomControl {
    pub fn from_config(config: &DeviceConfig) -> Result<Self, RuntimeError> {
        expect_at_least(config, 2, "room-control")?;
        Ok(Self)
    }
}

impl DeviceKind for RoomControl {
    fn kind_name(&self) -> &'static str {
        "room-control"
    }

    fn uses_cov(&self) -> bool {
        false
    }

    fn metadata_properties(&self) -> &'static [PropertyId] {
        HVAC_METADATA
    }

    fn live_properties(&self) -> &'static [PropertyId] {
        HVAC_LIVE
    }
}
