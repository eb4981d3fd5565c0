use core::fmt;

/// Object type identifiers as defined by the protocol numbering.
///
/// Known standard types are named variants; anything else is carried
/// through [`Proprietary`](Self::Proprietary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Device,
    MultiStateInput,
    MultiStateOutput,
    MultiStateValue,
    Proprietary(u16),
}

impl ObjectType {
    /// Converts this object type to its numeric identifier.
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::AnalogInput => 0,
            Self::AnalogOutput => 1,
            Self::AnalogValue => 2,
            Self::BinaryInput => 3,
            Self::BinaryOutput => 4,
            Self::BinaryValue => 5,
            Self::Device => 8,
            Self::MultiStateInput => 13,
            Self::MultiStateOutput => 14,
            Self::MultiStateValue => 19,
            Self::Proprietary(v) => v,
        }
    }

    /// Converts a numeric identifier to an object type.
    pub const fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::AnalogInput,
            1 => Self::AnalogOutput,
            2 => Self::AnalogValue,
            3 => Self::BinaryInput,
            4 => Self::BinaryOutput,
            5 => Self::BinaryValue,
            8 => Self::Device,
            13 => Self::MultiStateInput,
            14 => Self::MultiStateOutput,
            19 => Self::MultiStateValue,
            v => Self::Proprietary(v),
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::AnalogInput => "analog-input",
            Self::AnalogOutput => "analog-output",
            Self::AnalogValue => "analog-value",
            Self::BinaryInput => "binary-input",
            Self::BinaryOutput => "binary-output",
            Self::BinaryValue => "binary-value",
            Self::Device => "device",
            Self::MultiStateInput => "multi-state-input",
            Self::MultiStateOutput => "multi-state-output",
            Self::MultiStateValue => "multi-state-value",
            Self::Proprietary(_) => "proprietary",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proprietary(v) => write!(f, "proprietary-{v}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Identifies one addressable object on a remote device.
///
/// Equality is structural over the `(type, instance)` pair. Instance
/// numbers are 22-bit on the wire; validating that range is the codec's
/// concern, not this type's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectId {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectId {
    /// Creates an object id from a type and instance number.
    pub const fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}
