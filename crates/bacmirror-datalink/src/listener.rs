use crate::{LinkError, OutputChannel, SequenceCoordinator, UdpTransport, MAX_FRAME_LEN};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One inbound datagram, undecoded.
///
/// `reply` is a fresh channel bound to the sender's endpoint, usable for
/// unicast replies or broadcast. Transient: one event per datagram, never
/// persisted.
#[derive(Debug)]
pub struct RawEvent {
    pub payload: Vec<u8>,
    pub source: SocketAddr,
    pub reply: OutputChannel,
}

/// Where the listener actually bound.
#[derive(Debug, Clone, Copy)]
pub struct ListenInfo {
    pub local_addr: SocketAddr,
}

/// Binds the UDP endpoint and republishes every inbound datagram as a
/// [`RawEvent`]. Decodes nothing itself.
#[derive(Debug)]
pub struct SocketListener {
    transport: Arc<UdpTransport>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketListener {
    /// Binds `addr` and starts the receive loop.
    ///
    /// Returns the listener handle, the raw event stream, and the bound
    /// address. Binding failure is fatal and synchronous.
    pub async fn bind(
        addr: SocketAddr,
        sequencer: Arc<SequenceCoordinator>,
    ) -> Result<
        (
            Self,
            mpsc::UnboundedReceiver<RawEvent>,
            ListenInfo,
        ),
        LinkError,
    > {
        let transport = Arc::new(UdpTransport::bind(addr).await?);
        let info = ListenInfo {
            local_addr: transport.local_addr()?,
        };
        log::info!("listening on {}", info.local_addr);

        let (tx, rx) = mpsc::unbounded_channel();
        let loop_transport = transport.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_FRAME_LEN];
            loop {
                let (n, source) = match loop_transport.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(err) => {
                        // One bad datagram must not stop the listener.
                        log::debug!("recv error, skipping datagram: {err}");
                        continue;
                    }
                };
                let reply =
                    OutputChannel::new(loop_transport.clone(), sequencer.clone(), source);
                let event = RawEvent {
                    payload: buf[..n].to_vec(),
                    source,
                    reply,
                };
                if tx.send(event).is_err() {
                    break; // consumer dropped
                }
            }
        });

        Ok((
            Self {
                transport,
                task: Mutex::new(Some(task)),
            },
            rx,
            info,
        ))
    }

    /// The shared socket, for constructing outbound channels.
    pub fn transport(&self) -> Arc<UdpTransport> {
        self.transport.clone()
    }

    /// Stops the receive loop and closes the raw event stream. Idempotent.
    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::SocketListener;
    use crate::{SequenceCoordinator, UdpTransport};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn republishes_datagrams_with_reply_channel() {
        let sequencer = Arc::new(SequenceCoordinator::new(1, Duration::ZERO));
        let (listener, mut events, info) =
            SocketListener::bind(loopback(), sequencer).await.unwrap();

        let peer = UdpTransport::bind(loopback()).await.unwrap();
        peer.send_to(b"\x01\x02\x03", info.local_addr).await.unwrap();

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("no raw event")
            .expect("stream closed");
        assert_eq!(event.payload, vec![1, 2, 3]);
        assert_eq!(event.source, peer.local_addr().unwrap());
        assert_eq!(event.reply.address_info(), event.source);

        // The reply channel reaches back to the sender.
        event.reply.send_unicast(b"ack".to_vec()).await.unwrap();
        let mut buf = [0u8; 8];
        let (n, _) = timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .expect("no reply")
            .unwrap();
        assert_eq!(&buf[..n], b"ack");

        listener.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_the_stream() {
        let sequencer = Arc::new(SequenceCoordinator::new(1, Duration::ZERO));
        let (listener, mut events, _info) =
            SocketListener::bind(loopback(), sequencer).await.unwrap();

        listener.stop();
        listener.stop();

        let next = timeout(Duration::from_millis(200), events.recv()).await;
        assert!(next.expect("recv should settle once stopped").is_none());
    }
}
