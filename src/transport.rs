//! UDP transport layer for FINS communication.
//!
//! The transport only knows about datagrams and bytes: one exchange sends a
//! complete frame and waits, bounded by a timeout, for the next datagram.
//! A reply that arrives after its exchange timed out stays queued on the
//! socket; [`Transport::drain_pending`] and [`Transport::receive`] let the
//! client discard it and keep waiting for the reply it actually wants.
//!
//! [`Transport`] is the seam the rest of the gateway depends on, so the
//! [`SimulatedPlc`](crate::SimulatedPlc) can stand in for a real controller.
//!
//! # Constants
//!
//! - [`DEFAULT_FINS_PORT`] - Default FINS UDP port (9600)
//! - [`DEFAULT_TIMEOUT`] - Default timeout (2 seconds)
//! - [`MAX_PACKET_SIZE`] - Maximum UDP packet size (2048 bytes)

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::error::{FinsError, Result};

/// Default FINS UDP port.
pub const DEFAULT_FINS_PORT: u16 = 9600;

/// Default timeout for UDP operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum UDP packet size for FINS.
pub const MAX_PACKET_SIZE: usize = 2048;

/// One request/one reply exchange with a PLC.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `frame` as a single datagram and returns the raw reply.
    ///
    /// # Errors
    ///
    /// `FinsError::Timeout` when no reply arrives in time, `FinsError::Io`
    /// for socket failures.
    async fn exchange(&self, frame: &[u8]) -> Result<Vec<u8>>;

    /// Waits for one more datagram without sending anything, bounded by the
    /// same timeout as [`exchange`](Transport::exchange).
    ///
    /// # Errors
    ///
    /// `FinsError::Timeout` when nothing arrives in time.
    async fn receive(&self) -> Result<Vec<u8>>;

    /// Discards datagrams already queued without waiting and returns how
    /// many were dropped.
    fn drain_pending(&self) -> usize {
        0
    }

    /// Human-readable description of the remote end, used in logs.
    fn describe(&self) -> String;
}

/// UDP transport for FINS communication.
pub struct UdpTransport {
    socket: UdpSocket,
    remote_addr: SocketAddr,
    timeout: Duration,
}

impl UdpTransport {
    /// Binds an ephemeral local port and connects it to the PLC address.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket cannot be created or connected.
    pub async fn connect(plc_addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let bind_addr: SocketAddr = if plc_addr.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(plc_addr).await?;

        tracing::debug!(
            remote = %plc_addr,
            local = ?socket.local_addr().ok(),
            timeout_ms = timeout.as_millis() as u64,
            "FINS UDP transport ready"
        );

        Ok(Self {
            socket,
            remote_addr: plc_addr,
            timeout,
        })
    }

    /// Returns the remote PLC address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Returns the configured reply timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn exchange(&self, frame: &[u8]) -> Result<Vec<u8>> {
        self.socket.send(frame).await?;
        self.receive().await
    }

    async fn receive(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        match tokio::time::timeout(self.timeout, self.socket.recv(&mut buffer)).await {
            Ok(Ok(size)) => {
                buffer.truncate(size);
                Ok(buffer)
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => Err(FinsError::Timeout),
            Ok(Err(e)) => Err(FinsError::Io(e)),
            Err(_elapsed) => Err(FinsError::Timeout),
        }
    }

    fn drain_pending(&self) -> usize {
        let mut buffer = [0u8; MAX_PACKET_SIZE];
        let mut drained = 0;
        while self.socket.try_recv(&mut buffer).is_ok() {
            drained += 1;
        }
        drained
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.remote_addr)
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.socket.local_addr().ok())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_FINS_PORT, 9600);
        assert_eq!(DEFAULT_TIMEOUT, Duration::from_secs(2));
        assert_eq!(MAX_PACKET_SIZE, 2048);
    }

    #[tokio::test]
    async fn test_exchange_returns_reply() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, peer) = responder.recv_from(&mut buf).await.unwrap();
            let mut reply = buf[..n].to_vec();
            reply.reverse();
            responder.send_to(&reply, peer).await.unwrap();
        });

        let transport = UdpTransport::connect(responder_addr, Duration::from_secs(1))
            .await
            .unwrap();
        let reply = transport.exchange(&[1, 2, 3]).await.unwrap();
        assert_eq!(reply, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::connect(silent.local_addr().unwrap(), Duration::from_millis(50))
            .await
            .unwrap();

        let err = transport.exchange(&[0x80]).await.unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");
    }

    #[tokio::test]
    async fn test_receive_returns_late_datagram() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, peer) = responder.recv_from(&mut buf).await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
            responder.send_to(&buf[..n], peer).await.unwrap();
        });

        let transport = UdpTransport::connect(responder_addr, Duration::from_millis(40))
            .await
            .unwrap();
        assert!(transport.exchange(&[9, 9]).await.unwrap_err().is_timeout());

        let late = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match transport.receive().await {
                    Ok(reply) => break reply,
                    Err(e) => assert!(e.is_timeout(), "unexpected error {e:?}"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(late, vec![9, 9]);
        assert_eq!(transport.drain_pending(), 0);
    }

    #[tokio::test]
    async fn test_debug_output() {
        let addr: SocketAddr = "127.0.0.1:9600".parse().unwrap();
        let transport = UdpTransport::connect(addr, Duration::from_millis(100))
            .await
            .unwrap();
        let debug_str = format!("{:?}", transport);
        assert!(debug_str.contains("UdpTransport"));
        assert!(debug_str.contains("127.0.0.1:9600"));
        assert_eq!(transport.describe(), "udp://127.0.0.1:9600");
    }
}
