use core::fmt;

/// Property identifiers.
///
/// Common standard properties are named variants; unrecognised identifiers
/// use [`Proprietary`](Self::Proprietary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PropertyId {
    CovIncrement,
    Description,
    ObjectIdentifier,
    ObjectList,
    ObjectName,
    PresentValue,
    Reliability,
    StatusFlags,
    Units,
    VendorIdentifier,
    Proprietary(u32),
}

impl PropertyId {
    pub const fn to_u32(self) -> u32 {
        match self {
            Self::CovIncrement => 22,
            Self::Description => 28,
            Self::ObjectIdentifier => 75,
            Self::ObjectList => 76,
            Self::ObjectName => 77,
            Self::PresentValue => 85,
            Self::Reliability => 103,
            Self::StatusFlags => 111,
            Self::Units => 117,
            Self::VendorIdentifier => 120,
            Self::Proprietary(v) => v,
        }
    }

    pub const fn from_u32(value: u32) -> Self {
        match value {
            22 => Self::CovIncrement,
            28 => Self::Description,
            75 => Self::ObjectIdentifier,
            76 => Self::ObjectList,
            77 => Self::ObjectName,
            85 => Self::PresentValue,
            103 => Self::Reliability,
            111 => Self::StatusFlags,
            117 => Self::Units,
            120 => Self::VendorIdentifier,
            v => Self::Proprietary(v),
        }
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CovIncrement => f.write_str("cov-increment"),
            Self::Description => f.write_str("description"),
            Self::ObjectIdentifier => f.write_str("object-identifier"),
            Self::ObjectList => f.write_str("object-list"),
            Self::ObjectName => f.write_str("object-name"),
            Self::PresentValue => f.write_str("present-value"),
            Self::Reliability => f.write_str("reliability"),
            Self::StatusFlags => f.write_str("status-flags"),
            Self::Units => f.write_str("units"),
            Self::VendorIdentifier => f.write_str("vendor-identifier"),
            Self::Proprietary(v) => write!(f, "proprietary-{v}"),
        }
    }
}

/// The health bitset read from a remote object's status-flags property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusFlags {
    pub in_alarm: bool,
    pub fault: bool,
    pub overridden: bool,
    pub out_of_service: bool,
}

impl StatusFlags {
    /// Alarm, fault, or out-of-service all count as unhealthy; an
    /// overridden object still reports values and stays healthy.
    pub const fn is_healthy(self) -> bool {
        !(self.in_alarm || self.fault || self.out_of_service)
    }

    /// Names the active unhealthy conditions, e.g. `"in-alarm, fault"`.
    pub fn condition_summary(self) -> String {
        let mut parts = Vec::new();
        if self.in_alarm {
            parts.push("in-alarm");
        }
        if self.fault {
            parts.push("fault");
        }
        if self.out_of_service {
            parts.push("out-of-service");
        }
        parts.join(", ")
    }
}

/// A decoded property value.
///
/// This is the projection the runtime inspects; richer constructed values
/// stay inside the codec's own representation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u32),
    Real(f32),
    Enumerated(u32),
    Text(String),
    Flags(StatusFlags),
}

impl PropertyValue {
    pub fn as_real(&self) -> Option<f32> {
        match self {
            Self::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_flags(&self) -> Option<StatusFlags> {
        match self {
            Self::Flags(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Unsigned(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Enumerated(v) => write!(f, "enum({v})"),
            Self::Text(v) => f.write_str(v),
            Self::Flags(v) if v.is_healthy() => f.write_str("flags(clear)"),
            Self::Flags(v) => write!(f, "flags({})", v.condition_summary()),
        }
    }
}
