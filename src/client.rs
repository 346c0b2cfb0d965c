//! FINS client: command construction, SID correlation and reply validation.
//!
//! [`FinsClient`] turns word-level reads and writes into exactly one
//! request each. It never re-sends; callers that want retries (the handshake
//! coordinator) apply their own policy.
//!
//! A reply that arrives after its request timed out would otherwise be taken
//! as the answer to the next request. Before sending, the client drains
//! anything already queued, and a reply carrying another SID is discarded
//! while the client keeps waiting, up to [`MAX_SID_RETRIES`] times.
//!
//! Exchanges against one PLC are single-flight: the client holds an async
//! mutex for the duration of each round trip so that concurrent tasks
//! sharing the client never receive each other's replies.
//!
//! # Example
//!
//! ```
//! use fins_gateway::{FinsClient, MemoryArea, NodeAddress, SimulatedPlc};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> fins_gateway::Result<()> {
//! let plc = SimulatedPlc::new();
//! let client = FinsClient::new(plc.clone(), NodeAddress::new(0, 1, 0), NodeAddress::new(0, 10, 0));
//!
//! client.write(MemoryArea::DM, 200, &[0x1234, 0x5678]).await?;
//! assert_eq!(client.read(MemoryArea::DM, 200, 2).await?, vec![0x1234, 0x5678]);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Mutex;

use crate::command::{ReadWordCommand, WriteWordCommand};
use crate::error::{FinsError, Result};
use crate::header::NodeAddress;
use crate::memory::MemoryArea;
use crate::response::FinsResponse;
use crate::transport::Transport;

/// Replies with a foreign SID discarded before giving up on an exchange.
pub const MAX_SID_RETRIES: usize = 3;

/// FINS client bound to one PLC endpoint.
pub struct FinsClient {
    transport: Box<dyn Transport>,
    source: NodeAddress,
    destination: NodeAddress,
    sid_counter: AtomicU8,
    in_flight: Mutex<()>,
}

impl FinsClient {
    /// Creates a client over `transport`.
    pub fn new(
        transport: impl Transport + 'static,
        source: NodeAddress,
        destination: NodeAddress,
    ) -> Self {
        Self {
            transport: Box::new(transport),
            source,
            destination,
            sid_counter: AtomicU8::new(0),
            in_flight: Mutex::new(()),
        }
    }

    fn next_sid(&self) -> u8 {
        self.sid_counter.fetch_add(1, Ordering::Relaxed)
    }

    async fn round_trip(&self, frame: &[u8], sid: u8) -> Result<FinsResponse> {
        let response = {
            let _turn = self.in_flight.lock().await;
            let stale = self.transport.drain_pending();
            if stale > 0 {
                tracing::debug!(stale, "discarded late replies before sending");
            }
            self.exchange_with_sid(frame, sid).await?
        };
        response.check_error()?;
        Ok(response)
    }

    async fn exchange_with_sid(&self, frame: &[u8], sid: u8) -> Result<FinsResponse> {
        let mut reply = self.transport.exchange(frame).await?;
        let mut discarded = 0;
        loop {
            let response = FinsResponse::from_bytes(&reply)?;
            if response.header.sid == sid {
                return Ok(response);
            }
            if discarded == MAX_SID_RETRIES {
                return Err(FinsError::sid_mismatch(sid, response.header.sid));
            }
            discarded += 1;
            tracing::debug!(
                expected = sid,
                received = response.header.sid,
                "discarding reply to an earlier request"
            );
            reply = self.transport.receive().await?;
        }
    }

    /// Reads `count` words starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the count is out of range, the exchange fails, or
    /// the PLC reports a non-zero end code.
    pub async fn read(&self, area: MemoryArea, address: u16, count: u16) -> Result<Vec<u16>> {
        let sid = self.next_sid();
        let cmd = ReadWordCommand::new(self.destination, self.source, sid, area, address, count)?;

        let response = self.round_trip(&cmd.to_bytes(), sid).await?;
        let words = response.to_words(count)?;
        tracing::trace!(%area, address, count, sid, "area read");
        Ok(words)
    }

    /// Writes `data` starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is empty or too long, the exchange fails,
    /// or the PLC reports a non-zero end code.
    pub async fn write(&self, area: MemoryArea, address: u16, data: &[u16]) -> Result<()> {
        let sid = self.next_sid();
        let cmd = WriteWordCommand::new(self.destination, self.source, sid, area, address, data)?;

        self.round_trip(&cmd.to_bytes(), sid).await?;
        tracing::trace!(%area, address, count = data.len(), sid, "area write");
        Ok(())
    }

    /// Returns the source node address.
    pub fn source(&self) -> NodeAddress {
        self.source
    }

    /// Returns the destination node address.
    pub fn destination(&self) -> NodeAddress {
        self.destination
    }
}

impl std::fmt::Debug for FinsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinsClient")
            .field("transport", &self.transport.describe())
            .field("source", &self.source)
            .field("destination", &self.destination)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use crate::sim::SimulatedPlc;
    use crate::transport::UdpTransport;

    fn client(plc: &SimulatedPlc) -> FinsClient {
        FinsClient::new(
            plc.clone(),
            NodeAddress::new(0, 1, 0),
            NodeAddress::new(0, 10, 0),
        )
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let plc = SimulatedPlc::new();
        let client = client(&plc);

        client.write(MemoryArea::DM, 100, &[1, 2, 3]).await.unwrap();
        assert_eq!(plc.word(101), 2);
        assert_eq!(client.read(MemoryArea::DM, 100, 3).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_protocol_error_surfaces() {
        let plc = SimulatedPlc::new();
        plc.reject_writes(500..501, 0x2101);
        let client = client(&plc);

        let err = client.write(MemoryArea::DM, 500, &[7]).await.unwrap_err();
        match err {
            FinsError::Protocol { code, message } => {
                assert_eq!(code, 0x2101);
                assert_eq!(message, "read-only");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
        assert_eq!(plc.word(500), 0);
    }

    #[tokio::test]
    async fn test_timeout_surfaces() {
        let plc = SimulatedPlc::new();
        plc.time_out_next(1);
        let client = client(&plc);

        assert!(client.read(MemoryArea::DM, 0, 1).await.unwrap_err().is_timeout());
        assert!(client.read(MemoryArea::DM, 0, 1).await.is_ok());
    }

    /// Serves `plc` over UDP. The reply to the first request is held back
    /// by `first_delay`; every reply is sent `copies` times.
    async fn serve_over_udp(plc: SimulatedPlc, first_delay: Duration, copies: usize) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let mut delay = first_delay;
            loop {
                let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
                let reply = plc.exchange(&buf[..n]).await.unwrap();
                tokio::time::sleep(std::mem::take(&mut delay)).await;
                for _ in 0..copies {
                    socket.send_to(&reply, peer).await.unwrap();
                }
            }
        });
        addr
    }

    async fn udp_client(addr: SocketAddr, timeout: Duration) -> FinsClient {
        let transport = UdpTransport::connect(addr, timeout).await.unwrap();
        FinsClient::new(transport, NodeAddress::new(0, 1, 0), NodeAddress::new(0, 10, 0))
    }

    #[tokio::test]
    async fn test_late_reply_does_not_desync_later_exchanges() {
        let plc = SimulatedPlc::new();
        plc.set_words(300, &[11, 22]);
        let addr = serve_over_udp(plc, Duration::from_millis(150), 1).await;
        let client = udp_client(addr, Duration::from_millis(100)).await;

        assert!(client.read(MemoryArea::DM, 300, 1).await.unwrap_err().is_timeout());
        for _ in 0..5 {
            assert_eq!(client.read(MemoryArea::DM, 300, 2).await.unwrap(), vec![11, 22]);
        }
    }

    #[tokio::test]
    async fn test_duplicate_replies_are_discarded() {
        let plc = SimulatedPlc::new();
        let addr = serve_over_udp(plc.clone(), Duration::ZERO, 2).await;
        let client = udp_client(addr, Duration::from_millis(500)).await;

        for value in 1..=4u16 {
            client.write(MemoryArea::DM, 400, &[value]).await.unwrap();
            assert_eq!(client.read(MemoryArea::DM, 400, 1).await.unwrap(), vec![value]);
        }
        assert_eq!(plc.word(400), 4);
    }

    #[test]
    fn test_debug_output() {
        let client = client(&SimulatedPlc::new());
        let debug_str = format!("{:?}", client);
        assert!(debug_str.contains("FinsClient"));
        assert!(debug_str.contains("simulated"));
    }
}
