use crate::router::{DecodedEvent, FlowRouter};
use crate::RuntimeError;
use bacmirror_core::{
    Codec, ObjectId, PropertyId, PropertyReport, PropertyValue, ServiceKind, ServiceRequest,
    service::SERVICE_READ_PROPERTY,
};
use bacmirror_datalink::{OutputChannel, SequenceCoordinator, UdpTransport};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Process id stamped on COV subscriptions issued by this runtime.
const SUBSCRIBER_PROCESS_ID: u32 = 1;

/// The current change-of-value lease window.
///
/// An immutable snapshot recomputed on every coordinator tick and shared
/// read-only through the watch channel; every subscriber renews against
/// the identical window.
#[derive(Debug, Clone, Copy)]
pub struct CovLease {
    pub issued_at: Instant,
    pub expires_at: Instant,
    pub period: Duration,
}

impl CovLease {
    fn issue(period: Duration) -> Self {
        let now = Instant::now();
        Self {
            issued_at: now,
            expires_at: now + period,
            period,
        }
    }

    /// Lease length in whole seconds as sent on the wire, at least one.
    pub fn lifetime_seconds(&self) -> u32 {
        (self.period.as_secs_f64().ceil() as u64).clamp(1, u64::from(u32::MAX)) as u32
    }
}

/// Ticks the shared COV lease and manufactures request facades.
///
/// Centralizing the lease tick avoids one timer per device object racing
/// for the lease value; COV subscribers renew on every published lease,
/// before the previous window expires.
pub struct ServiceCoordinator {
    codec: Arc<dyn Codec>,
    transport: Arc<UdpTransport>,
    sequencer: Arc<SequenceCoordinator>,
    router: Arc<FlowRouter>,
    lease: watch::Sender<CovLease>,
    tick: Mutex<Option<JoinHandle<()>>>,
    invoke_id: Arc<AtomicU8>,
}

impl ServiceCoordinator {
    pub fn new(
        codec: Arc<dyn Codec>,
        transport: Arc<UdpTransport>,
        sequencer: Arc<SequenceCoordinator>,
        router: Arc<FlowRouter>,
    ) -> Self {
        let (lease, _) = watch::channel(CovLease::issue(Duration::ZERO));
        Self {
            codec,
            transport,
            sequencer,
            router,
            lease,
            tick: Mutex::new(None),
            invoke_id: Arc::new(AtomicU8::new(1)),
        }
    }

    /// Starts the lease tick: a fresh [`CovLease`] every `period`, with
    /// one emitted immediately so the first subscriber never waits a full
    /// period. Restarts any previous tick.
    pub fn init_manager(&self, period: Duration) {
        let lease = self.lease.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                let next = CovLease::issue(period);
                log::trace!("cov lease renewed, expires in {period:?}");
                lease.send_replace(next);
            }
        });
        self.replace_tick(Some(task));
    }

    /// The lease stream. `borrow()` gives the current window; `changed()`
    /// signals each renewal.
    pub fn lease_receiver(&self) -> watch::Receiver<CovLease> {
        self.lease.subscribe()
    }

    /// Stops the lease tick. Idempotent.
    pub fn destroy(&self) {
        self.replace_tick(None);
    }

    fn replace_tick(&self, new: Option<JoinHandle<()>>) {
        let mut slot = match self.tick.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = new;
    }

    /// A request facade bound to one destination and priority.
    pub fn create_api_service(&self, destination: SocketAddr, priority: u8) -> ApiService {
        let channel = OutputChannel::new(
            self.transport.clone(),
            self.sequencer.clone(),
            destination,
        );
        ApiService {
            confirmed: ConfirmedRequests {
                codec: self.codec.clone(),
                channel: channel.clone(),
                router: self.router.clone(),
                lease: self.lease.subscribe(),
                invoke_id: self.invoke_id.clone(),
                priority,
            },
            unconfirmed: UnconfirmedRequests {
                codec: self.codec.clone(),
                channel,
            },
        }
    }
}

impl Drop for ServiceCoordinator {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Request facades for one destination.
pub struct ApiService {
    confirmed: ConfirmedRequests,
    unconfirmed: UnconfirmedRequests,
}

impl ApiService {
    pub fn confirmed(&self) -> &ConfirmedRequests {
        &self.confirmed
    }

    pub fn unconfirmed(&self) -> &UnconfirmedRequests {
        &self.unconfirmed
    }

    pub fn destination(&self) -> SocketAddr {
        self.confirmed.channel.address_info()
    }
}

/// Confirmed (acknowledged) request surface.
pub struct ConfirmedRequests {
    codec: Arc<dyn Codec>,
    channel: OutputChannel,
    router: Arc<FlowRouter>,
    lease: watch::Receiver<CovLease>,
    invoke_id: Arc<AtomicU8>,
    priority: u8,
}

impl ConfirmedRequests {
    fn next_invoke_id(&self) -> u8 {
        // Wrapping add; invoke id 0 is reserved by convention.
        let id = self.invoke_id.fetch_add(1, Ordering::AcqRel);
        if id == 0 {
            self.invoke_id.fetch_add(1, Ordering::AcqRel)
        } else {
            id
        }
    }

    async fn send(&self, request: ServiceRequest) -> Result<(), RuntimeError> {
        let payload = self.codec.encode(&request)?;
        self.channel.send_unicast(payload).await?;
        Ok(())
    }

    pub async fn read_property(
        &self,
        object: ObjectId,
        property: PropertyId,
    ) -> Result<(), RuntimeError> {
        self.send(ServiceRequest::ReadProperty {
            object,
            property,
            invoke_id: self.next_invoke_id(),
        })
        .await
    }

    /// Issues a read and waits for the matching acknowledgement, with an
    /// explicit deadline. Interest is registered before the request goes
    /// out; a reply arriving after the deadline is simply dropped.
    pub async fn read_property_awaited(
        &self,
        object: ObjectId,
        property: PropertyId,
        deadline: Duration,
    ) -> Result<Vec<PropertyReport>, RuntimeError> {
        let reply = self.router.wait_for(
            move |event: &DecodedEvent| {
                event.layer.kind == ServiceKind::ComplexAck
                    && event.layer.choice == SERVICE_READ_PROPERTY
                    && event.layer.object == Some(object)
                    && event.layer.property == Some(property)
            },
            deadline,
        );
        self.read_property(object, property).await?;
        let event = reply.await?;
        Ok(event.layer.values.clone())
    }

    pub async fn write_property(
        &self,
        object: ObjectId,
        property: PropertyId,
        values: Vec<PropertyValue>,
    ) -> Result<(), RuntimeError> {
        self.send(ServiceRequest::WriteProperty {
            object,
            property,
            values,
            priority: self.priority,
            invoke_id: self.next_invoke_id(),
        })
        .await
    }

    /// Subscribes for change-of-value notifications, reading the current
    /// lease length at call time.
    pub async fn subscribe_cov(&self, object: ObjectId) -> Result<(), RuntimeError> {
        let lifetime_seconds = self.lease.borrow().lifetime_seconds();
        self.send(ServiceRequest::SubscribeCov {
            object,
            process_id: SUBSCRIBER_PROCESS_ID,
            lifetime_seconds,
            invoke_id: self.next_invoke_id(),
        })
        .await
    }

    pub async fn unsubscribe_cov(&self, object: ObjectId) -> Result<(), RuntimeError> {
        self.send(ServiceRequest::UnsubscribeCov {
            object,
            process_id: SUBSCRIBER_PROCESS_ID,
            invoke_id: self.next_invoke_id(),
        })
        .await
    }
}

/// Unconfirmed request surface: discovery announcements, no correlation.
pub struct UnconfirmedRequests {
    codec: Arc<dyn Codec>,
    channel: OutputChannel,
}

impl UnconfirmedRequests {
    pub async fn who_is_unicast(&self) -> Result<(), RuntimeError> {
        let payload = self.codec.encode(&ServiceRequest::WhoIs {
            instance_range: None,
        })?;
        self.channel.send_unicast(payload).await?;
        Ok(())
    }

    pub async fn who_is_broadcast(&self) -> Result<(), RuntimeError> {
        let payload = self.codec.encode(&ServiceRequest::WhoIs {
            instance_range: None,
        })?;
        self.channel.send_broadcast(payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CovLease, ServiceCoordinator};
    use crate::router::FlowRouter;
    use bacmirror_core::{
        Codec, DecodeError, EncodeError, ObjectId, ObjectType, PropertyId, PropertyValue,
        ProtocolLayer, ServiceRequest,
    };
    use bacmirror_datalink::{SequenceCoordinator, UdpTransport};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Instant};

    /// Records every encoded request; produces placeholder bytes.
    #[derive(Default)]
    struct CaptureCodec {
        requests: Mutex<Vec<ServiceRequest>>,
    }

    impl Codec for CaptureCodec {
        fn encode(&self, request: &ServiceRequest) -> Result<Vec<u8>, EncodeError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(vec![0])
        }

        fn decode(&self, _payload: &[u8]) -> Result<ProtocolLayer, DecodeError> {
            Err(DecodeError::Unsupported)
        }
    }

    async fn coordinator_with(codec: Arc<CaptureCodec>) -> ServiceCoordinator {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let transport = Arc::new(UdpTransport::bind(bind).await.unwrap());
        let sequencer = Arc::new(SequenceCoordinator::new(1, Duration::ZERO));
        let (_raw_tx, raw_rx) = mpsc::unbounded_channel();
        let router = FlowRouter::start(codec.clone(), raw_rx);
        ServiceCoordinator::new(codec, transport, sequencer, router)
    }

    #[tokio::test]
    async fn lease_ticks_immediately_then_periodically() {
        let codec = Arc::new(CaptureCodec::default());
        let coordinator = coordinator_with(codec).await;
        let mut lease_rx = coordinator.lease_receiver();

        let period = Duration::from_millis(100);
        let started = Instant::now();
        coordinator.init_manager(period);

        timeout(Duration::from_millis(80), lease_rx.changed())
            .await
            .expect("first lease was not immediate")
            .unwrap();
        let first: CovLease = *lease_rx.borrow_and_update();
        assert_eq!(first.expires_at - first.issued_at, period);

        timeout(Duration::from_millis(250), lease_rx.changed())
            .await
            .expect("second lease never arrived")
            .unwrap();
        let second: CovLease = *lease_rx.borrow_and_update();
        assert_eq!(second.expires_at - second.issued_at, period);
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(80),
            "second lease arrived after only {elapsed:?}"
        );

        coordinator.destroy();
        coordinator.destroy();
        let silent = timeout(Duration::from_millis(250), lease_rx.changed()).await;
        assert!(silent.is_err(), "lease kept ticking after destroy");
    }

    #[tokio::test]
    async fn facade_constructs_requests_with_fresh_invoke_ids() {
        let codec = Arc::new(CaptureCodec::default());
        let coordinator = coordinator_with(codec.clone()).await;
        let mut lease_rx = coordinator.lease_receiver();
        coordinator.init_manager(Duration::from_secs(60));
        timeout(Duration::from_millis(500), lease_rx.changed())
            .await
            .expect("no initial lease")
            .unwrap();

        let api = coordinator.create_api_service("127.0.0.1:47999".parse().unwrap(), 8);
        let object = ObjectId::new(ObjectType::AnalogValue, 4);

        api.confirmed()
            .read_property(object, PropertyId::ObjectName)
            .await
            .unwrap();
        api.confirmed()
            .write_property(object, PropertyId::PresentValue, vec![PropertyValue::Real(1.0)])
            .await
            .unwrap();
        api.confirmed().subscribe_cov(object).await.unwrap();
        api.unconfirmed().who_is_unicast().await.unwrap();

        let requests = codec.requests.lock().unwrap();
        assert_eq!(requests.len(), 4);

        match (&requests[0], &requests[1], &requests[2], &requests[3]) {
            (
                ServiceRequest::ReadProperty {
                    invoke_id: first, ..
                },
                ServiceRequest::WriteProperty {
                    invoke_id: second,
                    priority,
                    ..
                },
                ServiceRequest::SubscribeCov {
                    invoke_id: third,
                    lifetime_seconds,
                    ..
                },
                ServiceRequest::WhoIs { .. },
            ) => {
                assert_ne!(first, second);
                assert_ne!(second, third);
                assert_eq!(*priority, 8);
                assert_eq!(*lifetime_seconds, 60, "lease length not read at call time");
            }
            other => panic!("unexpected request sequence: {other:?}"),
        }
    }
}
