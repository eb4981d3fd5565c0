use crate::subscriptions::SubscriptionHandle;
use crate::RuntimeError;
use bacmirror_core::{Codec, DecodeError, ObjectId, PropertyId, ServiceKind};
use bacmirror_datalink::{OutputChannel, RawEvent};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 128;

/// One successfully decoded inbound datagram, fanned out to every
/// response-channel subscriber.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub layer: Arc<bacmirror_core::ProtocolLayer>,
    pub source: SocketAddr,
    pub reply: OutputChannel,
}

/// One datagram the codec rejected. Published on the error channel;
/// never silently dropped, never fatal.
#[derive(Debug, Clone)]
pub struct DecodeFailure {
    pub source: SocketAddr,
    pub error: DecodeError,
}

/// Decodes raw datagrams and fans them out on two independent broadcast
/// channels: decoded layers on one, decode failures on the other.
///
/// Multicast semantics: every subscriber sees every event and applies its
/// own filter chain. A subscriber that stops pulling lags and skips old
/// events; it never blocks the decode loop or other subscribers.
pub struct FlowRouter {
    responses: broadcast::Sender<DecodedEvent>,
    failures: broadcast::Sender<DecodeFailure>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FlowRouter {
    /// Spawns the decode loop over `raw` events.
    ///
    /// The loop ends when the raw stream closes (listener stopped).
    pub fn start(codec: Arc<dyn Codec>, mut raw: mpsc::UnboundedReceiver<RawEvent>) -> Arc<Self> {
        let (responses, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (failures, _) = broadcast::channel(CHANNEL_CAPACITY);

        let response_tx = responses.clone();
        let failure_tx = failures.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = raw.recv().await {
                let RawEvent {
                    payload,
                    source,
                    reply,
                } = event;
                match codec.decode(&payload) {
                    Ok(layer) => {
                        // Send fails only when nobody is subscribed.
                        let _ = response_tx.send(DecodedEvent {
                            layer: Arc::new(layer),
                            source,
                            reply,
                        });
                    }
                    Err(error) => {
                        log::warn!("decode failure from {source}: {error}");
                        let _ = failure_tx.send(DecodeFailure { source, error });
                    }
                }
            }
        });

        Arc::new(Self {
            responses,
            failures,
            task: Mutex::new(Some(task)),
        })
    }

    /// Subscribes to the response broadcast channel.
    pub fn responses(&self) -> broadcast::Receiver<DecodedEvent> {
        self.responses.subscribe()
    }

    /// Subscribes to the decode-error broadcast channel.
    pub fn decode_errors(&self) -> broadcast::Receiver<DecodeFailure> {
        self.failures.subscribe()
    }

    /// Spawns a forwarding task that applies `filter` to every response
    /// event and delivers matches on the returned stream. The handle
    /// cancels the forwarding; it belongs in the owner's
    /// [`SubscriptionSet`](crate::SubscriptionSet).
    pub fn subscribe_where<F>(
        &self,
        filter: F,
    ) -> (mpsc::UnboundedReceiver<DecodedEvent>, SubscriptionHandle)
    where
        F: Fn(&DecodedEvent) -> bool + Send + 'static,
    {
        let mut rx = self.responses.subscribe();
        let (tx, out) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if filter(&event) && tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("response subscriber lagged, skipped {skipped} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        (out, SubscriptionHandle::new(task))
    }

    /// Waits for the first response event matching `filter`, up to
    /// `deadline`. A reply arriving after the deadline finds no
    /// subscriber and is dropped by the broadcast channel.
    ///
    /// The subscription is registered when this is *called*, not when the
    /// returned future is polled, so callers can register interest before
    /// issuing the request the reply answers.
    pub fn wait_for<F>(
        &self,
        filter: F,
        deadline: Duration,
    ) -> impl std::future::Future<Output = Result<DecodedEvent, RuntimeError>>
    where
        F: Fn(&DecodedEvent) -> bool,
    {
        let mut rx = self.responses.subscribe();
        async move {
            let wait = async {
                loop {
                    match rx.recv().await {
                        Ok(event) if filter(&event) => return Some(event),
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => return None,
                    }
                }
            };
            match tokio::time::timeout(deadline, wait).await {
                Ok(Some(event)) => Ok(event),
                _ => Err(RuntimeError::Timeout),
            }
        }
    }

    /// Stops the decode loop. Idempotent; normally unnecessary because
    /// stopping the listener closes the raw stream.
    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl Drop for FlowRouter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Filter: layer has the given service kind.
pub fn is_service_kind(kind: ServiceKind) -> impl Fn(&DecodedEvent) -> bool {
    move |event| event.layer.kind == kind
}

/// Filter: layer has the given service choice.
pub fn is_service_choice(choice: u8) -> impl Fn(&DecodedEvent) -> bool {
    move |event| event.layer.choice == choice
}

/// Filter: layer addresses the given object (structural equality).
pub fn is_object(id: ObjectId) -> impl Fn(&DecodedEvent) -> bool {
    move |event| event.layer.object == Some(id)
}

/// Filter: layer addresses the given property.
pub fn is_property(id: PropertyId) -> impl Fn(&DecodedEvent) -> bool {
    move |event| event.layer.property == Some(id)
}

/// Filter: datagram originated from the given IP (any port).
pub fn is_from(ip: IpAddr) -> impl Fn(&DecodedEvent) -> bool {
    move |event| event.source.ip() == ip
}

/// Wraps a predicate that only applies when `required` is set; passes
/// everything through otherwise. Drives the configurable ip / vendor /
/// device-id matching.
pub fn match_filter<F>(
    required: bool,
    predicate: F,
    label: &'static str,
) -> impl Fn(&DecodedEvent) -> bool
where
    F: Fn(&DecodedEvent) -> bool,
{
    move |event| {
        if !required {
            return true;
        }
        let matched = predicate(event);
        if !matched {
            log::trace!("event from {} rejected by {label} filter", event.source);
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::{is_object, is_service_choice, match_filter, FlowRouter};
    use bacmirror_core::{
        Codec, DecodeError, EncodeError, ObjectId, ObjectType, ProtocolLayer, ServiceKind,
        ServiceRequest,
    };
    use bacmirror_datalink::{OutputChannel, RawEvent, SequenceCoordinator, UdpTransport};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// Decodes `[choice]` into a bare unconfirmed layer; anything longer
    /// than one byte is rejected.
    struct ByteCodec;

    impl Codec for ByteCodec {
        fn encode(&self, _request: &ServiceRequest) -> Result<Vec<u8>, EncodeError> {
            Err(EncodeError::Unsupported)
        }

        fn decode(&self, payload: &[u8]) -> Result<ProtocolLayer, DecodeError> {
            match payload {
                [choice] => Ok(ProtocolLayer::new(ServiceKind::UnconfirmedRequest, *choice)),
                _ => Err(DecodeError::InvalidLength),
            }
        }
    }

    async fn raw_event(payload: &[u8]) -> RawEvent {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let transport = Arc::new(UdpTransport::bind(bind).await.unwrap());
        let sequencer = Arc::new(SequenceCoordinator::new(1, Duration::ZERO));
        let source: SocketAddr = "127.0.0.1:47808".parse().unwrap();
        RawEvent {
            payload: payload.to_vec(),
            source,
            reply: OutputChannel::new(transport, sequencer, source),
        }
    }

    #[tokio::test]
    async fn decode_failure_goes_only_to_the_error_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = FlowRouter::start(Arc::new(ByteCodec), rx);
        let mut responses = router.responses();
        let mut errors = router.decode_errors();

        tx.send(raw_event(&[1, 2, 3]).await).unwrap();

        let failure = timeout(Duration::from_secs(1), errors.recv())
            .await
            .expect("no decode failure published")
            .unwrap();
        assert_eq!(failure.error, DecodeError::InvalidLength);
        assert!(
            timeout(Duration::from_millis(100), responses.recv())
                .await
                .is_err(),
            "decode failure leaked onto the response channel"
        );

        // The loop keeps decoding afterwards.
        tx.send(raw_event(&[7]).await).unwrap();
        let decoded = timeout(Duration::from_secs(1), responses.recv())
            .await
            .expect("router stopped after a decode failure")
            .unwrap();
        assert_eq!(decoded.layer.choice, 7);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = FlowRouter::start(Arc::new(ByteCodec), rx);
        let mut first = router.responses();
        let mut second = router.responses();

        tx.send(raw_event(&[9]).await).unwrap();

        for rx in [&mut first, &mut second] {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("subscriber missed the event")
                .unwrap();
            assert_eq!(event.layer.choice, 9);
        }
    }

    #[tokio::test]
    async fn filtered_subscription_forwards_matches_only() {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = FlowRouter::start(Arc::new(ByteCodec), rx);
        let (mut matches, _handle) = router.subscribe_where(is_service_choice(2));

        tx.send(raw_event(&[1]).await).unwrap();
        tx.send(raw_event(&[2]).await).unwrap();

        let event = timeout(Duration::from_secs(1), matches.recv())
            .await
            .expect("matching event not forwarded")
            .unwrap();
        assert_eq!(event.layer.choice, 2);
        assert!(
            timeout(Duration::from_millis(100), matches.recv())
                .await
                .is_err(),
            "non-matching event was forwarded"
        );
    }

    #[tokio::test]
    async fn wait_for_times_out_without_a_match() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let router = FlowRouter::start(Arc::new(ByteCodec), rx);
        let result = router
            .wait_for(is_service_choice(1), Duration::from_millis(80))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn optional_match_filter_passes_when_not_required() {
        let expected = ObjectId::new(ObjectType::AnalogInput, 1);
        let optional = match_filter(false, is_object(expected), "device-id");
        let required = match_filter(true, is_object(expected), "device-id");

        let raw = raw_event(&[0]).await;
        let mut layer = ProtocolLayer::new(ServiceKind::UnconfirmedRequest, 0);
        layer.object = Some(ObjectId::new(ObjectType::AnalogInput, 2));
        let event = super::DecodedEvent {
            layer: Arc::new(layer),
            source: raw.source,
            reply: raw.reply,
        };

        assert!(optional(&event), "optional filter must pass a mismatch");
        assert!(!required(&event), "required filter must reject a mismatch");
    }
}
