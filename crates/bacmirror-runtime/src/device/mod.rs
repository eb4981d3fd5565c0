//! Concrete device types composed with the generic actor driver.
//!
//! Each type implements [`DeviceKind`](crate::DeviceKind) and validates
//! its own configuration shape; the rest of the lifecycle belongs to the
//! shared driver.

pub mod analog;
pub mod binary;
pub mod hvac;

pub use analog::{AnalogInput, AnalogValue};
pub use binary::{BinaryInput, BinaryValue};
pub use hvac::{RoomControl, Thermostat};

use crate::config::DeviceConfig;
use crate::RuntimeError;
use bacmirror_core::ObjectType;

/// A single-point kind mirrors exactly one object of its type.
fn expect_single_object(
    config: &DeviceConfig,
    expected: ObjectType,
    kind_name: &str,
) -> Result<(), RuntimeError> {
    match config.objects.as_slice() {
        [object] if object.object_type == expected => Ok(()),
        [object] => Err(RuntimeError::Config(format!(
            "{kind_name} actor configured with {object}, expected a {expected} object"
        ))),
        objects => Err(RuntimeError::Config(format!(
            "{kind_name} actor needs exactly one object, got {}",
            objects.len()
        ))),
    }
}

fn expect_at_least(
    config: &DeviceConfig,
    minimum: usize,
    kind_name: &str,
) -> Result<(), RuntimeError> {
    if config.objects.len() < minimum {
        return Err(RuntimeError::Config(format!(
            "{kind_name} actor needs at least {minimum} objects, got {}",
            config.objects.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{AnalogInput, BinaryValue, RoomControl, Thermostat};
    use crate::config::DeviceConfig;
    use bacmirror_core::{ObjectId, ObjectType};

    fn config(objects: Vec<ObjectId>) -> DeviceConfig {
        DeviceConfig::new("127.0.0.1:47808".parse().unwrap(), objects)
    }

    #[test]
    fn single_point_kinds_validate_object_shape() {
        let ai = ObjectId::new(ObjectType::AnalogInput, 3);
        let bv = ObjectId::new(ObjectType::BinaryValue, 7);

        assert!(AnalogInput::from_config(&config(vec![ai])).is_ok());
        assert!(AnalogInput::from_config(&config(vec![bv])).is_err());
        assert!(AnalogInput::from_config(&config(vec![ai, ai])).is_err());
        assert!(BinaryValue::from_config(&config(vec![bv])).is_ok());
        assert!(BinaryValue::from_config(&config(vec![])).is_err());
    }

    #[test]
    fn hvac_kinds_validate_object_counts() {
        let temp = ObjectId::new(ObjectType::AnalogInput, 1);
        let setpoint = ObjectId::new(ObjectType::AnalogValue, 2);

        assert!(Thermostat::from_config(&config(vec![temp])).is_ok());
        assert!(Thermostat::from_config(&config(vec![])).is_err());
        assert!(RoomControl::from_config(&config(vec![temp, setpoint])).is_ok());
        assert!(RoomControl::from_config(&config(vec![temp])).is_err());
    }
}
