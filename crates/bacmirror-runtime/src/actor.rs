use crate::config::{DeviceConfig, RuntimeConfig, DEFAULT_RESPONSE_TIMEOUT};
use crate::context::ConnectionContext;
use crate::heartbeat::StatusTimer;
use crate::router::{is_from, match_filter, DecodedEvent, FlowRouter};
use crate::services::ApiService;
use crate::subscriptions::SubscriptionSet;
use crate::RuntimeError;
use bacmirror_core::service::{SERVICE_COV_NOTIFICATION, SERVICE_I_AM, SERVICE_READ_PROPERTY};
use bacmirror_core::{ObjectId, PropertyId, PropertyValue, ServiceKind};
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Health of one mirrored device, as decided by its actor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OperationalStatus {
    #[default]
    Pending,
    Ok,
    Error(String),
}

impl fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Ok => f.write_str("ok"),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// One applied property update.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StateChange {
    pub object: ObjectId,
    pub property: PropertyId,
    pub value: PropertyValue,
}

/// Host-side sink for mirrored state. Injected per actor; the runtime
/// never assumes anything about the host beyond this contract.
pub trait StatePublisher: Send + Sync + 'static {
    fn publish_state_change(&self, change: &StateChange);
    fn publish_operational_state_change(&self, status: &OperationalStatus);
}

/// What a concrete device type contributes to the generic driver.
///
/// One implementation per device type, constructed from [`DeviceConfig`];
/// the driver owns the full lifecycle.
pub trait DeviceKind: Send + Sync + 'static {
    fn kind_name(&self) -> &'static str;
    /// Live values arrive via COV subscription when true, polling reads
    /// otherwise.
    fn uses_cov(&self) -> bool;
    /// Static metadata read once at startup.
    fn metadata_properties(&self) -> &'static [PropertyId];
    /// Live values, re-read on reconnect (and initially for polling kinds).
    fn live_properties(&self) -> &'static [PropertyId];
}

#[derive(Debug, Default)]
struct MirrorState {
    properties: HashMap<ObjectId, HashMap<PropertyId, PropertyValue>>,
    status: OperationalStatus,
    metadata_received: bool,
}

/// Handle to a running device actor.
///
/// The actor mirrors its objects' properties locally and keeps its
/// operational status current; [`stop`](Self::stop) tears down COV
/// subscriptions, stream listeners, and the heartbeat.
pub struct DeviceActor {
    stop_tx: mpsc::UnboundedSender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    state: Arc<Mutex<MirrorState>>,
    destination: SocketAddr,
}

impl DeviceActor {
    /// Validates the configuration and spawns the driver.
    pub fn spawn<K: DeviceKind>(
        ctx: &ConnectionContext,
        device: DeviceConfig,
        kind: K,
        publisher: Arc<dyn StatePublisher>,
    ) -> Result<Self, RuntimeError> {
        if device.objects.is_empty() {
            return Err(RuntimeError::Config(format!(
                "{} actor configured without objects",
                kind.kind_name()
            )));
        }

        let api = ctx
            .services
            .create_api_service(device.destination, ctx.config.priority);
        let subscriptions = SubscriptionSet::new();

        let object_set: HashSet<ObjectId> = device.objects.iter().copied().collect();
        let (inbound, handle) = ctx.router.subscribe_where(move |event| {
            let Some(object) = event.layer.object else {
                return false;
            };
            if !object_set.contains(&object) {
                return false;
            }
            match event.layer.kind {
                ServiceKind::UnconfirmedRequest | ServiceKind::ConfirmedRequest => {
                    event.layer.choice == SERVICE_COV_NOTIFICATION
                }
                ServiceKind::ComplexAck => event.layer.choice == SERVICE_READ_PROPERTY,
                _ => false,
            }
        });
        subscriptions.add(handle);

        let timer = StatusTimer::new(ctx.config.status_checks_interval);
        let (tick_tx, ticks) = mpsc::unbounded_channel();
        if timer.is_disabled() {
            log::debug!(
                "{} actor for {}: status checks disabled",
                kind.kind_name(),
                device.destination
            );
        } else {
            let tx = tick_tx.clone();
            timer.start(move |_| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(());
                }
            });
        }

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MirrorState::default()));
        let destination = device.destination;

        let driver = Driver {
            kind,
            objects: device.objects,
            expected_device: device.device,
            expected_vendor: device.vendor_id,
            config: ctx.config.clone(),
            api,
            router: ctx.router.clone(),
            publisher,
            state: state.clone(),
            subscriptions,
            timer,
            _tick_tx: tick_tx,
        };
        let lease_rx = ctx.services.lease_receiver();
        let task = tokio::spawn(driver.run(inbound, ticks, stop_rx, lease_rx));

        Ok(Self {
            stop_tx,
            task: Mutex::new(Some(task)),
            state,
            destination,
        })
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn operational_status(&self) -> OperationalStatus {
        self.lock_state().status.clone()
    }

    /// The locally mirrored value, if one has been received.
    pub fn property(&self, object: ObjectId, property: PropertyId) -> Option<PropertyValue> {
        self.lock_state()
            .properties
            .get(&object)
            .and_then(|map| map.get(&property))
            .cloned()
    }

    /// Whether all static metadata has arrived for every object.
    pub fn properties_received(&self) -> bool {
        self.lock_state().metadata_received
    }

    /// Graceful stop: unsubscribes COV, releases all stream listeners,
    /// cancels the heartbeat, then returns.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        let task = match self.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MirrorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct Driver<K: DeviceKind> {
    kind: K,
    objects: Vec<ObjectId>,
    expected_device: Option<ObjectId>,
    expected_vendor: Option<u32>,
    config: RuntimeConfig,
    api: ApiService,
    router: Arc<FlowRouter>,
    publisher: Arc<dyn StatePublisher>,
    state: Arc<Mutex<MirrorState>>,
    subscriptions: SubscriptionSet,
    timer: StatusTimer,
    /// Keeps the tick channel open while checks are disabled.
    _tick_tx: mpsc::UnboundedSender<()>,
}

impl<K: DeviceKind> Driver<K> {
    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<DecodedEvent>,
        mut ticks: mpsc::UnboundedReceiver<()>,
        mut stop: mpsc::UnboundedReceiver<()>,
        mut lease_rx: watch::Receiver<crate::services::CovLease>,
    ) {
        if self.config.unicast_who_is_confirmation {
            self.confirm_presence().await;
        }
        self.issue_initial_requests().await;
        // Initial subscriptions just went out against the current lease;
        // only later renewals should re-subscribe.
        lease_rx.mark_unchanged();
        let mut lease_alive = true;

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break, // subscription torn down
                },
                Some(()) = ticks.recv() => self.run_status_check().await,
                renewed = lease_rx.changed(), if lease_alive && self.kind.uses_cov() => {
                    match renewed {
                        Ok(()) => self.renew_subscriptions().await,
                        Err(_) => lease_alive = false, // coordinator destroyed
                    }
                }
                _ = stop.recv() => break,
            }
        }
        self.shutdown().await;
    }

    /// Unicast Who-Is handshake with the configurable match chain.
    async fn confirm_presence(&mut self) {
        let expected_ip = self.api.destination().ip();
        let expected_device = self.expected_device;
        let expected_vendor = self.expected_vendor;
        let ip_filter = match_filter(self.config.ip_match_required, is_from(expected_ip), "ip");
        let device_filter = match_filter(
            self.config.device_id_match_required,
            move |event: &DecodedEvent| {
                expected_device.map_or(true, |device| event.layer.device == Some(device))
            },
            "device-id",
        );
        let vendor_filter = match_filter(
            self.config.vendor_id_match_required,
            move |event: &DecodedEvent| {
                expected_vendor.map_or(true, |vendor| event.layer.vendor_id == Some(vendor))
            },
            "vendor-id",
        );
        let reply = self.router.wait_for(
            move |event| {
                event.layer.kind == ServiceKind::UnconfirmedRequest
                    && event.layer.choice == SERVICE_I_AM
                    && ip_filter(event)
                    && device_filter(event)
                    && vendor_filter(event)
            },
            DEFAULT_RESPONSE_TIMEOUT,
        );

        if let Err(err) = self.api.unconfirmed().who_is_unicast().await {
            log::warn!("who-is to {} failed: {err}", self.api.destination());
        }
        match reply.await {
            Ok(_) => log::debug!(
                "{} presence confirmed at {}",
                self.kind.kind_name(),
                self.api.destination()
            ),
            Err(_) => self.set_status(OperationalStatus::Error(format!(
                "no response to who-is from {}",
                self.api.destination()
            ))),
        }
    }

    /// Initial metadata reads plus, per kind, COV subscriptions or the
    /// first live reads. Re-run by the heartbeat until metadata lands.
    async fn issue_initial_requests(&self) {
        for &object in &self.objects {
            for &property in self.kind.metadata_properties() {
                if let Err(err) = self.api.confirmed().read_property(object, property).await {
                    log::warn!("initial read of {object} {property} failed: {err}");
                }
            }
        }
        if self.kind.uses_cov() {
            for &object in &self.objects {
                if let Err(err) = self.api.confirmed().subscribe_cov(object).await {
                    log::warn!("cov subscribe for {object} failed: {err}");
                }
            }
        } else {
            self.read_live_values().await;
        }
    }

    async fn read_live_values(&self) {
        for &object in &self.objects {
            for &property in self.kind.live_properties() {
                if let Err(err) = self.api.confirmed().read_property(object, property).await {
                    log::warn!("live read of {object} {property} failed: {err}");
                }
            }
        }
    }

    async fn renew_subscriptions(&self) {
        for &object in &self.objects {
            if let Err(err) = self.api.confirmed().subscribe_cov(object).await {
                log::debug!("cov renewal for {object} failed: {err}");
            }
        }
    }

    /// Applies one decoded COV notification or read-property ack. Every
    /// applied value publishes a state change immediately, no batching.
    fn handle_event(&mut self, event: DecodedEvent) {
        let Some(object) = event.layer.object else {
            return;
        };
        let mut changes = Vec::with_capacity(event.layer.values.len());
        {
            let mut state = self.lock_state();
            let map = state.properties.entry(object).or_default();
            for report in &event.layer.values {
                map.insert(report.property, report.value.clone());
                changes.push(StateChange {
                    object,
                    property: report.property,
                    value: report.value.clone(),
                });
            }
            if !state.metadata_received && self.metadata_complete(&state) {
                state.metadata_received = true;
                log::debug!(
                    "{} actor for {}: all metadata received",
                    self.kind.kind_name(),
                    self.api.destination()
                );
            }
        }
        for change in &changes {
            self.publisher.publish_state_change(change);
        }
    }

    fn metadata_complete(&self, state: &MirrorState) -> bool {
        self.objects.iter().all(|object| {
            let Some(map) = state.properties.get(object) else {
                return false;
            };
            self.kind
                .metadata_properties()
                .iter()
                .all(|property| map.contains_key(property))
        })
    }

    /// One heartbeat round: status-flag reads for every object, joined
    /// within the check window.
    async fn run_status_check(&mut self) {
        let deadline = self.timer.interval();
        let confirmed = self.api.confirmed();
        let reads = self.objects.iter().map(|&object| async move {
            (
                object,
                confirmed
                    .read_property_awaited(object, PropertyId::StatusFlags, deadline)
                    .await,
            )
        });

        let mut unreachable = Vec::new();
        let mut unhealthy = Vec::new();
        for (object, result) in join_all(reads).await {
            match result {
                Ok(reports) => {
                    let flags = reports
                        .iter()
                        .find(|report| report.property == PropertyId::StatusFlags)
                        .and_then(|report| report.value.as_flags());
                    match flags {
                        Some(flags) if !flags.is_healthy() => {
                            unhealthy.push(format!("{object}: {}", flags.condition_summary()));
                        }
                        Some(_) => {}
                        None => unreachable.push(format!("{object}: malformed status reply")),
                    }
                }
                Err(_) => {
                    unreachable.push(format!("{object}: no status reply within {deadline:?}"));
                }
            }
        }

        let check_succeeded = unreachable.is_empty();
        if check_succeeded {
            self.timer.report_successful_check();
        } else {
            let consecutive = self.timer.report_failed_check();
            log::debug!(
                "status check for {} failed ({consecutive} consecutive)",
                self.api.destination()
            );
        }

        let next = if !unreachable.is_empty() {
            OperationalStatus::Error(unreachable.join("; "))
        } else if !unhealthy.is_empty() {
            OperationalStatus::Error(unhealthy.join("; "))
        } else {
            OperationalStatus::Ok
        };
        let previous = self.lock_state().status.clone();
        let recovered =
            matches!(previous, OperationalStatus::Error(_)) && next == OperationalStatus::Ok;
        self.set_status(next);

        let metadata_received = self.lock_state().metadata_received;
        if check_succeeded && !metadata_received {
            // Still missing static metadata: repeat the initial requests.
            self.issue_initial_requests().await;
        } else if check_succeeded && !self.kind.uses_cov() {
            // Polling steady state: each healthy round refreshes live
            // values, and a recovery round picks up everything missed
            // while unreachable.
            if recovered {
                log::info!(
                    "{} recovered, re-reading live values",
                    self.api.destination()
                );
            }
            self.read_live_values().await;
        }
    }

    fn set_status(&mut self, status: OperationalStatus) {
        {
            let mut state = self.lock_state();
            if state.status == status {
                return;
            }
            log::debug!(
                "{} actor for {}: {} -> {}",
                self.kind.kind_name(),
                self.api.destination(),
                state.status,
                status
            );
            state.status = status.clone();
        }
        self.publisher.publish_operational_state_change(&status);
    }

    async fn shutdown(&mut self) {
        if self.kind.uses_cov() {
            for &object in &self.objects {
                if let Err(err) = self.api.confirmed().unsubscribe_cov(object).await {
                    log::debug!("cov unsubscribe for {object} failed: {err}");
                }
            }
        }
        self.subscriptions.destroy();
        self.timer.cancel();
        log::info!(
            "{} actor for {} stopped",
            self.kind.kind_name(),
            self.api.destination()
        );
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MirrorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
