//! Deterministic codec and simulated remote device.
//!
//! The runtime treats the wire grammar as an external collaborator; this
//! module supplies the stand-in used by tests and the loopback tool: a
//! compact tagged frame format carrying exactly the [`ProtocolLayer`]
//! projection, and a [`SimulatedDevice`] that answers ReadProperty,
//! WriteProperty, SubscribeCov, and Who-Is, and emits COV notifications
//! on demand. The device can be taken offline to simulate an unreachable
//! peer.

use bacmirror_core::service::{
    SERVICE_COV_NOTIFICATION, SERVICE_I_AM, SERVICE_READ_PROPERTY, SERVICE_SUBSCRIBE_COV,
    SERVICE_WHO_IS, SERVICE_WRITE_PROPERTY,
};
use bacmirror_core::{
    Codec, DecodeError, EncodeError, ObjectId, ObjectType, PropertyId, PropertyReport,
    PropertyValue, ProtocolLayer, ServiceKind, ServiceRequest, StatusFlags,
};
use bacmirror_datalink::{LinkError, UdpTransport, MAX_FRAME_LEN};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

const FLAG_OBJECT: u8 = 1 << 0;
const FLAG_PROPERTY: u8 = 1 << 1;
const FLAG_DEVICE: u8 = 1 << 2;
const FLAG_VENDOR: u8 = 1 << 3;
const FLAG_INVOKE: u8 = 1 << 4;
const FLAG_PRIORITY: u8 = 1 << 5;
const FLAG_LIFETIME: u8 = 1 << 6;

const VALUE_NULL: u8 = 0;
const VALUE_BOOLEAN: u8 = 1;
const VALUE_UNSIGNED: u8 = 2;
const VALUE_REAL: u8 = 3;
const VALUE_ENUMERATED: u8 = 4;
const VALUE_TEXT: u8 = 5;
const VALUE_FLAGS: u8 = 6;

/// Frame codec over the layer projection: `[kind][choice][flags]` then
/// the optional fields in flag order, then a counted value list.
pub struct FrameCodec;

impl Codec for FrameCodec {
    fn encode(&self, request: &ServiceRequest) -> Result<Vec<u8>, EncodeError> {
        Ok(Self::encode_layer(&Self::request_layer(request)))
    }

    fn decode(&self, payload: &[u8]) -> Result<ProtocolLayer, DecodeError> {
        Self::decode_layer(payload)
    }
}

impl FrameCodec {
    fn request_layer(request: &ServiceRequest) -> ProtocolLayer {
        let kind = if request.is_confirmed() {
            ServiceKind::ConfirmedRequest
        } else {
            ServiceKind::UnconfirmedRequest
        };
        let mut layer = ProtocolLayer::new(kind, request.choice());
        match request {
            ServiceRequest::ReadProperty {
                object,
                property,
                invoke_id,
            } => {
                layer.object = Some(*object);
                layer.property = Some(*property);
                layer.invoke_id = Some(*invoke_id);
            }
            ServiceRequest::WriteProperty {
                object,
                property,
                values,
                priority,
                invoke_id,
            } => {
                layer.object = Some(*object);
                layer.property = Some(*property);
                layer.priority = Some(*priority);
                layer.invoke_id = Some(*invoke_id);
                layer.values = values
                    .iter()
                    .map(|value| PropertyReport::new(*property, value.clone()))
                    .collect();
            }
            ServiceRequest::SubscribeCov {
                object,
                lifetime_seconds,
                invoke_id,
                ..
            } => {
                layer.object = Some(*object);
                layer.invoke_id = Some(*invoke_id);
                layer.lifetime_seconds = Some(*lifetime_seconds);
            }
            ServiceRequest::UnsubscribeCov {
                object, invoke_id, ..
            } => {
                layer.object = Some(*object);
                layer.invoke_id = Some(*invoke_id);
            }
            ServiceRequest::WhoIs { .. } => {}
        }
        layer
    }

    pub fn encode_layer(layer: &ProtocolLayer) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(kind_tag(layer.kind));
        out.push(layer.choice);

        let mut flags = 0u8;
        if layer.object.is_some() {
            flags |= FLAG_OBJECT;
        }
        if layer.property.is_some() {
            flags |= FLAG_PROPERTY;
        }
        if layer.device.is_some() {
            flags |= FLAG_DEVICE;
        }
        if layer.vendor_id.is_some() {
            flags |= FLAG_VENDOR;
        }
        if layer.invoke_id.is_some() {
            flags |= FLAG_INVOKE;
        }
        if layer.priority.is_some() {
            flags |= FLAG_PRIORITY;
        }
        if layer.lifetime_seconds.is_some() {
            flags |= FLAG_LIFETIME;
        }
        out.push(flags);

        if let Some(object) = layer.object {
            push_object(&mut out, object);
        }
        if let Some(property) = layer.property {
            out.extend_from_slice(&property.to_u32().to_be_bytes());
        }
        if let Some(device) = layer.device {
            push_object(&mut out, device);
        }
        if let Some(vendor) = layer.vendor_id {
            out.extend_from_slice(&vendor.to_be_bytes());
        }
        if let Some(invoke) = layer.invoke_id {
            out.push(invoke);
        }
        if let Some(priority) = layer.priority {
            out.push(priority);
        }
        if let Some(lifetime) = layer.lifetime_seconds {
            out.extend_from_slice(&lifetime.to_be_bytes());
        }

        out.push(layer.values.len() as u8);
        for report in &layer.values {
            out.extend_from_slice(&report.property.to_u32().to_be_bytes());
            push_value(&mut out, &report.value);
        }
        out
    }

    pub fn decode_layer(payload: &[u8]) -> Result<ProtocolLayer, DecodeError> {
        let mut r = Cursor::new(payload);
        let kind = kind_from_tag(r.u8()?)?;
        let choice = r.u8()?;
        let flags = r.u8()?;

        let mut layer = ProtocolLayer::new(kind, choice);
        if flags & FLAG_OBJECT != 0 {
            layer.object = Some(r.object()?);
        }
        if flags & FLAG_PROPERTY != 0 {
            layer.property = Some(PropertyId::from_u32(r.u32()?));
        }
        if flags & FLAG_DEVICE != 0 {
            layer.device = Some(r.object()?);
        }
        if flags & FLAG_VENDOR != 0 {
            layer.vendor_id = Some(r.u32()?);
        }
        if flags & FLAG_INVOKE != 0 {
            layer.invoke_id = Some(r.u8()?);
        }
        if flags & FLAG_PRIORITY != 0 {
            layer.priority = Some(r.u8()?);
        }
        if flags & FLAG_LIFETIME != 0 {
            layer.lifetime_seconds = Some(r.u32()?);
        }

        let count = r.u8()?;
        for _ in 0..count {
            let property = PropertyId::from_u32(r.u32()?);
            let value = r.value()?;
            layer.values.push(PropertyReport::new(property, value));
        }
        if !r.is_empty() {
            return Err(DecodeError::InvalidLength);
        }
        Ok(layer)
    }
}

fn kind_tag(kind: ServiceKind) -> u8 {
    match kind {
        ServiceKind::ConfirmedRequest => 0,
        ServiceKind::UnconfirmedRequest => 1,
        ServiceKind::SimpleAck => 2,
        ServiceKind::ComplexAck => 3,
        ServiceKind::Error => 4,
    }
}

fn kind_from_tag(tag: u8) -> Result<ServiceKind, DecodeError> {
    match tag {
        0 => Ok(ServiceKind::ConfirmedRequest),
        1 => Ok(ServiceKind::UnconfirmedRequest),
        2 => Ok(ServiceKind::SimpleAck),
        3 => Ok(ServiceKind::ComplexAck),
        4 => Ok(ServiceKind::Error),
        _ => Err(DecodeError::InvalidTag),
    }
}

fn push_object(out: &mut Vec<u8>, object: ObjectId) {
    out.extend_from_slice(&object.object_type.to_u16().to_be_bytes());
    out.extend_from_slice(&object.instance.to_be_bytes());
}

fn push_value(out: &mut Vec<u8>, value: &PropertyValue) {
    match value {
        PropertyValue::Null => out.push(VALUE_NULL),
        PropertyValue::Boolean(v) => {
            out.push(VALUE_BOOLEAN);
            out.push(u8::from(*v));
        }
        PropertyValue::Unsigned(v) => {
            out.push(VALUE_UNSIGNED);
            out.extend_from_slice(&v.to_be_bytes());
        }
        PropertyValue::Real(v) => {
            out.push(VALUE_REAL);
            out.extend_from_slice(&v.to_be_bytes());
        }
        PropertyValue::Enumerated(v) => {
            out.push(VALUE_ENUMERATED);
            out.extend_from_slice(&v.to_be_bytes());
        }
        PropertyValue::Text(v) => {
            out.push(VALUE_TEXT);
            let bytes = v.as_bytes();
            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(bytes);
        }
        PropertyValue::Flags(flags) => {
            out.push(VALUE_FLAGS);
            let mut bits = 0u8;
            if flags.in_alarm {
                bits |= 1 << 0;
            }
            if flags.fault {
                bits |= 1 << 1;
            }
            if flags.overridden {
                bits |= 1 << 2;
            }
            if flags.out_of_service {
                bits |= 1 << 3;
            }
            out.push(bits);
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() < n {
            return Err(DecodeError::UnexpectedEof);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn object(&mut self) -> Result<ObjectId, DecodeError> {
        let object_type = ObjectType::from_u16(self.u16()?);
        let instance = self.u32()?;
        Ok(ObjectId::new(object_type, instance))
    }

    fn value(&mut self) -> Result<PropertyValue, DecodeError> {
        match self.u8()? {
            VALUE_NULL => Ok(PropertyValue::Null),
            VALUE_BOOLEAN => Ok(PropertyValue::Boolean(self.u8()? != 0)),
            VALUE_UNSIGNED => Ok(PropertyValue::Unsigned(self.u32()?)),
            VALUE_REAL => {
                let bytes = self.take(4)?;
                Ok(PropertyValue::Real(f32::from_be_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3],
                ])))
            }
            VALUE_ENUMERATED => Ok(PropertyValue::Enumerated(self.u32()?)),
            VALUE_TEXT => {
                let len = usize::from(self.u16()?);
                let bytes = self.take(len)?;
                let text =
                    std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidValue)?;
                Ok(PropertyValue::Text(text.to_string()))
            }
            VALUE_FLAGS => {
                let bits = self.u8()?;
                Ok(PropertyValue::Flags(StatusFlags {
                    in_alarm: bits & (1 << 0) != 0,
                    fault: bits & (1 << 1) != 0,
                    overridden: bits & (1 << 2) != 0,
                    out_of_service: bits & (1 << 3) != 0,
                }))
            }
            _ => Err(DecodeError::InvalidTag),
        }
    }
}

type PropertyMap = HashMap<ObjectId, HashMap<PropertyId, PropertyValue>>;

/// A simulated remote field device on its own loopback socket.
///
/// Answers ReadProperty with complex acks, stores WriteProperty values,
/// tracks COV subscribers per object, and replies to Who-Is with I-Am.
/// While offline it receives and drops everything, which looks exactly
/// like an unreachable peer to the runtime.
pub struct SimulatedDevice {
    device_id: ObjectId,
    vendor_id: u32,
    transport: Arc<UdpTransport>,
    objects: Arc<Mutex<PropertyMap>>,
    subscribers: Arc<Mutex<HashMap<ObjectId, Vec<SocketAddr>>>>,
    read_counts: Arc<Mutex<HashMap<(ObjectId, PropertyId), usize>>>,
    offline: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedDevice {
    /// Binds a loopback socket and starts answering.
    pub async fn bind(instance: u32, vendor_id: u32) -> Result<Self, LinkError> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let transport = Arc::new(UdpTransport::bind(bind).await?);
        let device = Self {
            device_id: ObjectId::new(ObjectType::Device, instance),
            vendor_id,
            transport,
            objects: Arc::new(Mutex::new(HashMap::new())),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            read_counts: Arc::new(Mutex::new(HashMap::new())),
            offline: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        };
        device.start();
        Ok(device)
    }

    pub fn addr(&self) -> SocketAddr {
        self.transport
            .local_addr()
            .expect("simulator socket has a local address")
    }

    pub fn device_id(&self) -> ObjectId {
        self.device_id
    }

    /// Sets (or creates) a property without notifying subscribers.
    pub fn set_property(&self, object: ObjectId, property: PropertyId, value: PropertyValue) {
        lock(&self.objects)
            .entry(object)
            .or_default()
            .insert(property, value);
    }

    /// While offline the device drops every inbound request.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// How many ReadProperty requests have been answered for this pair.
    pub fn read_count(&self, object: ObjectId, property: PropertyId) -> usize {
        lock(&self.read_counts)
            .get(&(object, property))
            .copied()
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self, object: ObjectId) -> usize {
        lock(&self.subscribers)
            .get(&object)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Sends a COV notification for `object` to every subscriber,
    /// carrying its current present value and status flags.
    pub async fn notify_cov(&self, object: ObjectId) -> Result<(), LinkError> {
        let values: Vec<PropertyReport> = {
            let objects = lock(&self.objects);
            let Some(map) = objects.get(&object) else {
                return Ok(());
            };
            [PropertyId::PresentValue, PropertyId::StatusFlags]
                .into_iter()
                .filter_map(|property| {
                    map.get(&property)
                        .map(|value| PropertyReport::new(property, value.clone()))
                })
                .collect()
        };
        let targets: Vec<SocketAddr> = lock(&self.subscribers)
            .get(&object)
            .cloned()
            .unwrap_or_default();

        let mut layer = ProtocolLayer::new(ServiceKind::UnconfirmedRequest, SERVICE_COV_NOTIFICATION);
        layer.object = Some(object);
        layer.device = Some(self.device_id);
        layer.values = values;
        let payload = FrameCodec::encode_layer(&layer);
        for target in targets {
            self.transport.send_to(&payload, target).await?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }

    fn start(&self) {
        let transport = self.transport.clone();
        let objects = self.objects.clone();
        let subscribers = self.subscribers.clone();
        let read_counts = self.read_counts.clone();
        let offline = self.offline.clone();
        let device_id = self.device_id;
        let vendor_id = self.vendor_id;

        let task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_FRAME_LEN];
            loop {
                let (n, source) = match transport.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if offline.load(Ordering::Acquire) {
                    continue;
                }
                let Ok(layer) = FrameCodec::decode_layer(&buf[..n]) else {
                    continue;
                };
                let reply = handle_request(
                    &layer,
                    source,
                    device_id,
                    vendor_id,
                    &objects,
                    &subscribers,
                    &read_counts,
                );
                if let Some(reply) = reply {
                    let _ = transport
                        .send_to(&FrameCodec::encode_layer(&reply), source)
                        .await;
                }
            }
        });
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_request(
    layer: &ProtocolLayer,
    source: SocketAddr,
    device_id: ObjectId,
    vendor_id: u32,
    objects: &Mutex<PropertyMap>,
    subscribers: &Mutex<HashMap<ObjectId, Vec<SocketAddr>>>,
    read_counts: &Mutex<HashMap<(ObjectId, PropertyId), usize>>,
) -> Option<ProtocolLayer> {
    match (layer.kind, layer.choice) {
        (ServiceKind::ConfirmedRequest, SERVICE_READ_PROPERTY) => {
            let object = layer.object?;
            let property = layer.property?;
            let value = lock(objects).get(&object)?.get(&property)?.clone();
            *lock(read_counts).entry((object, property)).or_insert(0) += 1;

            let mut ack = ProtocolLayer::new(ServiceKind::ComplexAck, SERVICE_READ_PROPERTY);
            ack.object = Some(object);
            ack.property = Some(property);
            ack.invoke_id = layer.invoke_id;
            ack.values = vec![PropertyReport::new(property, value)];
            Some(ack)
        }
        (ServiceKind::ConfirmedRequest, SERVICE_WRITE_PROPERTY) => {
            let object = layer.object?;
            let property = layer.property?;
            if let Some(report) = layer.values.first() {
                lock(objects)
                    .entry(object)
                    .or_default()
                    .insert(property, report.value.clone());
            }
            let mut ack = ProtocolLayer::new(ServiceKind::SimpleAck, SERVICE_WRITE_PROPERTY);
            ack.object = Some(object);
            ack.invoke_id = layer.invoke_id;
            Some(ack)
        }
        (ServiceKind::ConfirmedRequest, SERVICE_SUBSCRIBE_COV) => {
            let object = layer.object?;
            let mut subscribers = lock(subscribers);
            let entry = subscribers.entry(object).or_default();
            if layer.lifetime_seconds.is_some() {
                if !entry.contains(&source) {
                    entry.push(source);
                }
            } else {
                entry.retain(|subscriber| *subscriber != source);
            }
            let mut ack = ProtocolLayer::new(ServiceKind::SimpleAck, SERVICE_SUBSCRIBE_COV);
            ack.object = Some(object);
            ack.invoke_id = layer.invoke_id;
            Some(ack)
        }
        (ServiceKind::UnconfirmedRequest, SERVICE_WHO_IS) => {
            let mut i_am = ProtocolLayer::new(ServiceKind::UnconfirmedRequest, SERVICE_I_AM);
            i_am.device = Some(device_id);
            i_am.object = Some(device_id);
            i_am.vendor_id = Some(vendor_id);
            Some(i_am)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::FrameCodec;
    use bacmirror_core::{
        Codec, DecodeError, ObjectId, ObjectType, PropertyId, PropertyValue, ServiceKind,
        ServiceRequest, StatusFlags,
    };

    #[test]
    fn read_property_request_round_trips() {
        let object = ObjectId::new(ObjectType::AnalogInput, 3);
        let payload = FrameCodec
            .encode(&ServiceRequest::ReadProperty {
                object,
                property: PropertyId::PresentValue,
                invoke_id: 17,
            })
            .unwrap();
        let layer = FrameCodec.decode(&payload).unwrap();
        assert_eq!(layer.kind, ServiceKind::ConfirmedRequest);
        assert_eq!(layer.object, Some(object));
        assert_eq!(layer.property, Some(PropertyId::PresentValue));
        assert_eq!(layer.invoke_id, Some(17));
    }

    #[test]
    fn subscribe_and_unsubscribe_differ_by_lifetime() {
        let object = ObjectId::new(ObjectType::BinaryValue, 9);
        let subscribe = FrameCodec
            .encode(&ServiceRequest::SubscribeCov {
                object,
                process_id: 1,
                lifetime_seconds: 120,
                invoke_id: 1,
            })
            .unwrap();
        let unsubscribe = FrameCodec
            .encode(&ServiceRequest::UnsubscribeCov {
                object,
                process_id: 1,
                invoke_id: 2,
            })
            .unwrap();

        assert_eq!(
            FrameCodec.decode(&subscribe).unwrap().lifetime_seconds,
            Some(120)
        );
        assert_eq!(FrameCodec.decode(&unsubscribe).unwrap().lifetime_seconds, None);
    }

    #[test]
    fn status_flags_survive_the_wire() {
        let flags = StatusFlags {
            fault: true,
            out_of_service: true,
            ..StatusFlags::default()
        };
        let object = ObjectId::new(ObjectType::AnalogValue, 2);
        let payload = FrameCodec
            .encode(&ServiceRequest::WriteProperty {
                object,
                property: PropertyId::StatusFlags,
                values: vec![PropertyValue::Flags(flags)],
                priority: 16,
                invoke_id: 3,
            })
            .unwrap();
        let layer = FrameCodec.decode(&payload).unwrap();
        assert_eq!(
            layer.value_of(PropertyId::StatusFlags),
            Some(&PropertyValue::Flags(flags))
        );
    }

    #[test]
    fn truncated_and_trailing_garbage_are_rejected() {
        let payload = FrameCodec
            .encode(&ServiceRequest::WhoIs {
                instance_range: None,
            })
            .unwrap();

        assert_eq!(
            FrameCodec.decode(&payload[..2]),
            Err(DecodeError::UnexpectedEof)
        );
        let mut padded = payload.clone();
        padded.push(0xFF);
        assert_eq!(FrameCodec.decode(&padded), Err(DecodeError::InvalidLength));
        assert_eq!(FrameCodec.decode(&[9, 0, 0, 0]), Err(DecodeError::InvalidTag));
    }
}
