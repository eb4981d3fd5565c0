use crate::address::broadcast_addr;
use crate::transport::{UdpTransport, MAX_FRAME_LEN};
use crate::{LinkError, SequenceCoordinator};
use std::net::SocketAddr;
use std::sync::Arc;

/// Outbound path toward one remote endpoint.
///
/// Both send paths route through the shared [`SequenceCoordinator`]:
/// unicast under the remote `addr:port` key, broadcast under the
/// `255.255.255.255:port` key, so each gets its own pacing. Dropping a
/// channel only releases its references; the socket and coordinator are
/// shared and stay open.
#[derive(Debug, Clone)]
pub struct OutputChannel {
    transport: Arc<UdpTransport>,
    sequencer: Arc<SequenceCoordinator>,
    remote: SocketAddr,
}

impl OutputChannel {
    pub fn new(
        transport: Arc<UdpTransport>,
        sequencer: Arc<SequenceCoordinator>,
        remote: SocketAddr,
    ) -> Self {
        Self {
            transport,
            sequencer,
            remote,
        }
    }

    /// The bound remote endpoint, for correlation and logging.
    pub fn address_info(&self) -> SocketAddr {
        self.remote
    }

    pub async fn send_unicast(&self, payload: Vec<u8>) -> Result<(), LinkError> {
        self.dispatch(self.remote, payload).await
    }

    pub async fn send_broadcast(&self, payload: Vec<u8>) -> Result<(), LinkError> {
        self.dispatch(broadcast_addr(self.remote.port()), payload).await
    }

    async fn dispatch(&self, target: SocketAddr, payload: Vec<u8>) -> Result<(), LinkError> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(LinkError::FrameTooLarge {
                len: payload.len(),
                max: MAX_FRAME_LEN,
            });
        }
        let transport = self.transport.clone();
        self.sequencer
            .submit(
                target,
                Box::new(move || {
                    Box::pin(async move { transport.send_to(&payload, target).await })
                }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::OutputChannel;
    use crate::transport::MAX_FRAME_LEN;
    use crate::{LinkError, SequenceCoordinator, UdpTransport};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn unicast_goes_through_the_sequencer() {
        let sender = Arc::new(UdpTransport::bind(loopback()).await.unwrap());
        let receiver = UdpTransport::bind(loopback()).await.unwrap();
        let sequencer = Arc::new(SequenceCoordinator::new(1, Duration::ZERO));

        let channel =
            OutputChannel::new(sender, sequencer, receiver.local_addr().unwrap());
        channel.send_unicast(b"hello".to_vec()).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
            .await
            .expect("recv timed out")
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_before_queueing() {
        let transport = Arc::new(UdpTransport::bind(loopback()).await.unwrap());
        let sequencer = Arc::new(SequenceCoordinator::new(1, Duration::ZERO));
        let channel = OutputChannel::new(
            transport,
            sequencer.clone(),
            "127.0.0.1:47808".parse().unwrap(),
        );

        let result = channel.send_unicast(vec![0u8; MAX_FRAME_LEN + 1]).await;
        assert!(matches!(result, Err(LinkError::FrameTooLarge { .. })));
        assert!(sequencer.is_idle().await);
    }
}
