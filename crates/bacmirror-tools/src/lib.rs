use bacmirror_core::ObjectType;
use clap::ValueEnum;

/// CLI-friendly selector for mirrored object types.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ObjectTypeArg {
    AnalogInput,
    AnalogValue,
    BinaryInput,
    BinaryValue,
}

impl ObjectTypeArg {
    pub const fn into_object_type(self) -> ObjectType {
        match self {
            Self::AnalogInput => ObjectType::AnalogInput,
            Self::AnalogValue => ObjectType::AnalogValue,
            Self::BinaryInput => ObjectType::BinaryInput,
            Self::BinaryValue => ObjectType::BinaryValue,
        }
    }
}
