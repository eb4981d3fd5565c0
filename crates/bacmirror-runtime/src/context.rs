use crate::config::RuntimeConfig;
use crate::router::FlowRouter;
use crate::services::ServiceCoordinator;
use crate::RuntimeError;
use bacmirror_core::Codec;
use bacmirror_datalink::{ListenInfo, SequenceCoordinator, SocketListener, UdpTransport};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Everything one logical device connection shares.
///
/// Constructed once, handed by reference to every actor, destroyed as a
/// unit. This is the explicit, connection-scoped replacement for a
/// process-wide registry: managers reach their children as fields, the
/// COV lease travels on the service coordinator's watch channel, and no
/// global mutable state exists.
pub struct ConnectionContext {
    pub config: RuntimeConfig,
    pub transport: Arc<UdpTransport>,
    pub sequencer: Arc<SequenceCoordinator>,
    pub router: Arc<FlowRouter>,
    pub services: Arc<ServiceCoordinator>,
    listener: SocketListener,
    listen_info: ListenInfo,
}

impl ConnectionContext {
    /// Binds the configured port on all interfaces and starts the
    /// listener, router, and lease tick.
    pub async fn connect(
        config: RuntimeConfig,
        codec: Arc<dyn Codec>,
    ) -> Result<Self, RuntimeError> {
        let bind = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            config.normalized_port(),
        );
        Self::connect_on(config, codec, bind).await
    }

    /// Like [`connect`](Self::connect) but with an explicit bind address
    /// (loopback and ephemeral ports in tests and diagnostics).
    pub async fn connect_on(
        config: RuntimeConfig,
        codec: Arc<dyn Codec>,
        bind: SocketAddr,
    ) -> Result<Self, RuntimeError> {
        let sequencer = Arc::new(SequenceCoordinator::new(
            config.sequence.concurrency,
            config.sequence.delay,
        ));
        let (listener, raw_rx, listen_info) =
            SocketListener::bind(bind, sequencer.clone()).await?;
        let transport = listener.transport();
        let router = FlowRouter::start(codec.clone(), raw_rx);
        let services = Arc::new(ServiceCoordinator::new(
            codec,
            transport.clone(),
            sequencer.clone(),
            router.clone(),
        ));
        let mut lease_rx = services.lease_receiver();
        services.init_manager(config.cov_timer.period);
        // The first lease is emitted immediately; wait for it so every
        // facade created from this context reads a real window.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), lease_rx.changed()).await;

        Ok(Self {
            config,
            transport,
            sequencer,
            router,
            services,
            listener,
            listen_info,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listen_info.local_addr
    }

    /// Tears the connection down: stops the listener and lease tick,
    /// then drains the sequencer so no in-flight send is abandoned.
    pub async fn shutdown(&self) {
        self.listener.stop();
        self.services.destroy();
        self.sequencer.shutdown().await;
        log::info!("connection on {} shut down", self.listen_info.local_addr);
    }
}
