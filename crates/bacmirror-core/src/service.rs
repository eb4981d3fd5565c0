use crate::{ObjectId, PropertyId, PropertyValue};

/// Service choice: SubscribeCOV (confirmed).
pub const SERVICE_SUBSCRIBE_COV: u8 = 5;
/// Service choice: ReadProperty (confirmed).
pub const SERVICE_READ_PROPERTY: u8 = 12;
/// Service choice: WriteProperty (confirmed).
pub const SERVICE_WRITE_PROPERTY: u8 = 15;
/// Service choice: I-Am (unconfirmed).
pub const SERVICE_I_AM: u8 = 0;
/// Service choice: COV notification (unconfirmed).
pub const SERVICE_COV_NOTIFICATION: u8 = 2;
/// Service choice: Who-Is (unconfirmed).
pub const SERVICE_WHO_IS: u8 = 8;

/// The top-level shape of a decoded protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServiceKind {
    ConfirmedRequest,
    UnconfirmedRequest,
    SimpleAck,
    ComplexAck,
    Error,
}

/// One property value reported inside a decoded layer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PropertyReport {
    pub property: PropertyId,
    pub value: PropertyValue,
}

impl PropertyReport {
    pub fn new(property: PropertyId, value: PropertyValue) -> Self {
        Self { property, value }
    }
}

/// The decoded projection of one inbound datagram.
///
/// Produced by the external [`Codec`](crate::Codec). The runtime only
/// inspects this common projection; whatever else the codec decodes stays
/// on its side of the boundary. Optional fields are absent when the
/// service shape does not carry them.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtocolLayer {
    pub kind: ServiceKind,
    pub choice: u8,
    /// The addressed or monitored object, when the service names one.
    pub object: Option<ObjectId>,
    /// The addressed property (acks and single-property services).
    pub property: Option<PropertyId>,
    /// Reported property values; one entry for acks, possibly several for
    /// COV notifications.
    pub values: Vec<PropertyReport>,
    /// Initiating device object (I-Am, COV notifications).
    pub device: Option<ObjectId>,
    /// Vendor identifier (I-Am).
    pub vendor_id: Option<u32>,
    pub invoke_id: Option<u8>,
    pub priority: Option<u8>,
    pub lifetime_seconds: Option<u32>,
}

impl ProtocolLayer {
    /// A bare layer with the given shape and no optional fields.
    pub fn new(kind: ServiceKind, choice: u8) -> Self {
        Self {
            kind,
            choice,
            object: None,
            property: None,
            values: Vec::new(),
            device: None,
            vendor_id: None,
            invoke_id: None,
            priority: None,
            lifetime_seconds: None,
        }
    }

    /// Looks up the first reported value for `property`.
    pub fn value_of(&self, property: PropertyId) -> Option<&PropertyValue> {
        self.values
            .iter()
            .find(|report| report.property == property)
            .map(|report| &report.value)
    }
}

/// A request this runtime can issue, handed to the codec for encoding.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServiceRequest {
    ReadProperty {
        object: ObjectId,
        property: PropertyId,
        invoke_id: u8,
    },
    WriteProperty {
        object: ObjectId,
        property: PropertyId,
        values: Vec<PropertyValue>,
        priority: u8,
        invoke_id: u8,
    },
    SubscribeCov {
        object: ObjectId,
        process_id: u32,
        lifetime_seconds: u32,
        invoke_id: u8,
    },
    UnsubscribeCov {
        object: ObjectId,
        process_id: u32,
        invoke_id: u8,
    },
    WhoIs {
        /// Restricts the answering device instance range when present.
        instance_range: Option<(u32, u32)>,
    },
}

impl ServiceRequest {
    /// The service choice this request encodes to.
    pub const fn choice(&self) -> u8 {
        match self {
            Self::ReadProperty { .. } => SERVICE_READ_PROPERTY,
            Self::WriteProperty { .. } => SERVICE_WRITE_PROPERTY,
            Self::SubscribeCov { .. } | Self::UnsubscribeCov { .. } => SERVICE_SUBSCRIBE_COV,
            Self::WhoIs { .. } => SERVICE_WHO_IS,
        }
    }

    /// Whether this request expects an acknowledgement.
    pub const fn is_confirmed(&self) -> bool {
        !matches!(self, Self::WhoIs { .. })
    }
}
