use crate::LinkError;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Maximum datagram payload this transport will send or receive.
pub const MAX_FRAME_LEN: usize = 1500;

/// The shared UDP endpoint for one logical connection.
///
/// Bound once, then shared (via `Arc`) by the listener and every output
/// channel. Send ordering toward any destination is owned by the
/// [`SequenceCoordinator`](crate::SequenceCoordinator); callers never
/// write to the socket directly.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds the endpoint with broadcast enabled.
    ///
    /// Failure (port in use, privilege) is fatal and reported
    /// synchronously; it is never retried.
    pub async fn bind(addr: SocketAddr) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| LinkError::Bind { addr, source })?;
        socket
            .set_broadcast(true)
            .map_err(|source| LinkError::Bind { addr, source })?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        self.socket.local_addr().map_err(LinkError::Io)
    }

    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<(), LinkError> {
        self.socket.send_to(payload, target).await?;
        Ok(())
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), LinkError> {
        let (n, source) = self.socket.recv_from(buf).await?;
        Ok((n, source))
    }
}

#[cfg(test)]
mod tests {
    use super::UdpTransport;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tokio::time::timeout;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn loopback_round_trip() {
        let a = UdpTransport::bind(loopback()).await.unwrap();
        let b = UdpTransport::bind(loopback()).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"ping", b_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, source) = timeout(Duration::from_secs(1), b.recv_from(&mut buf))
            .await
            .expect("recv timed out")
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(source, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn bind_conflict_is_fatal() {
        let first = UdpTransport::bind(loopback()).await.unwrap();
        let taken = first.local_addr().unwrap();
        let second = UdpTransport::bind(taken).await;
        assert!(second.is_err());
    }
}
