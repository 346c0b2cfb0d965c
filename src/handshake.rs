//! Turn-taking flags shared with the PLC program.
//!
//! Each channel owns one word in the flag block:
//!
//! | Channel | Flag | Gateway may act when | Gateway sets afterwards |
//! |---------|------|----------------------|-------------------------|
//! | write | D4000 | flag = 1 | 0 (PLC owns the slots) |
//! | read *n* | D4001+n | always | 1 (slot consumed) |
//! | failure | D4011 | flag = 0 (report pending) | 1 (report consumed) |
//!
//! Nothing here blocks waiting for the PLC: a closed channel is reported
//! and the caller tries again on its next scheduled run.

use std::time::Duration;

use thiserror::Error;

use crate::error::FinsError;
use crate::marshal::UNINITIALIZED_WORD;
use crate::memory_map::{MemoryMap, SlotId};
use crate::registers::EquipmentRegisters;

const FLAG_SET: u16 = 1;
const FLAG_CLEAR: u16 = 0;

/// Errors raised by the handshake coordinator.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The PLC has not released the write slots.
    #[error("PLC not ready: write flag D{address} is {value:#06X}")]
    NotReady {
        /// Flag address.
        address: u16,
        /// Raw flag value read.
        value: u16,
    },

    /// Flag access failed after retries.
    #[error(transparent)]
    Fins(#[from] FinsError),
}

/// Retry policy for flag access. Only timeouts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least one.
    pub attempts: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Proof that the PLC released the write slots.
///
/// Obtained from [`Handshake::acquire_write`] and handed back through
/// [`Handshake::release_write`] once every slot is written.
#[must_use = "a write turn must be released once the slots are written"]
#[derive(Debug)]
pub struct WriteTurn {
    _private: (),
}

/// Handshake coordinator.
#[derive(Debug, Clone)]
pub struct Handshake {
    registers: EquipmentRegisters,
    retry: RetryPolicy,
}

impl Handshake {
    /// Creates a coordinator over the register service's client and map.
    pub fn new(registers: EquipmentRegisters, retry: RetryPolicy) -> Self {
        Self { registers, retry }
    }

    fn map(&self) -> &MemoryMap {
        self.registers.map()
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, address: u16, mut op: F) -> Result<T, FinsError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FinsError>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_timeout() && attempt < attempts => {
                    tracing::debug!(what, address, attempt, "flag access timed out, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry.backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn read_flag(&self, address: u16) -> Result<u16, FinsError> {
        let client = self.registers.client();
        let area = self.map().area;
        let words = self
            .with_retry("read", address, || client.read(area, address, 1))
            .await?;
        Ok(words.first().copied().unwrap_or(UNINITIALIZED_WORD))
    }

    async fn write_flag(&self, address: u16, value: u16) -> Result<(), FinsError> {
        let client = self.registers.client();
        let area = self.map().area;
        let data = [value];
        self.with_retry("write", address, || client.write(area, address, &data))
            .await
    }

    /// Takes the write turn if the PLC has released the write slots.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::NotReady`] when the flag is 0 or uninitialized; no
    /// slot is touched in that case.
    pub async fn acquire_write(&self) -> Result<WriteTurn, HandshakeError> {
        let address = self.map().write_flag;
        let value = self.read_flag(address).await?;
        if value != FLAG_SET {
            tracing::info!(address, value, "write channel closed");
            return Err(HandshakeError::NotReady { address, value });
        }
        tracing::debug!(address, "write turn acquired");
        Ok(WriteTurn { _private: () })
    }

    /// Hands the write slots to the PLC by clearing the write flag.
    pub async fn release_write(&self, turn: WriteTurn) -> Result<(), HandshakeError> {
        let WriteTurn { .. } = turn;
        let address = self.map().write_flag;
        self.write_flag(address, FLAG_CLEAR).await?;
        tracing::debug!(address, "write turn released");
        Ok(())
    }

    /// Reads the raw write flag without taking the turn.
    pub async fn write_flag_value(&self) -> Result<u16, HandshakeError> {
        Ok(self.read_flag(self.map().write_flag).await?)
    }

    /// Tells the PLC read slot `slot` has been consumed.
    pub async fn mark_read_consumed(&self, slot: u8) -> Result<(), HandshakeError> {
        let address = self.map().flag_address(SlotId::Read(slot))?;
        self.write_flag(address, FLAG_SET).await?;
        tracing::trace!(slot, address, "read slot consumed");
        Ok(())
    }

    /// Returns whether the PLC has posted a failure report.
    pub async fn failure_report_pending(&self) -> Result<bool, HandshakeError> {
        Ok(self.read_flag(self.map().failure_flag).await? == FLAG_CLEAR)
    }

    /// Tells the PLC the failure report has been consumed.
    pub async fn mark_failure_consumed(&self) -> Result<(), HandshakeError> {
        self.write_flag(self.map().failure_flag, FLAG_SET).await?;
        Ok(())
    }

    /// The register service used for slot access.
    pub fn registers(&self) -> &EquipmentRegisters {
        &self.registers
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::FinsClient;
    use crate::header::NodeAddress;
    use crate::sim::SimulatedPlc;

    fn handshake(plc: &SimulatedPlc, attempts: u32) -> Handshake {
        let client = FinsClient::new(plc.clone(), NodeAddress::new(0, 1, 0), NodeAddress::new(0, 10, 0));
        let registers = EquipmentRegisters::new(Arc::new(client), Arc::new(MemoryMap::standard()));
        Handshake::new(
            registers,
            RetryPolicy {
                attempts,
                backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_closed_write_channel_refuses() {
        let plc = SimulatedPlc::new();
        plc.set_word(4000, 0);
        let hs = handshake(&plc, 1);

        match hs.acquire_write().await.unwrap_err() {
            HandshakeError::NotReady { address, value } => assert_eq!((address, value), (4000, 0)),
            other => panic!("expected NotReady, got {other:?}"),
        }
        assert_eq!(plc.writes_into(1000..2500), 0);
    }

    #[tokio::test]
    async fn test_uninitialized_write_flag_refuses() {
        let plc = SimulatedPlc::new();
        plc.fill_uninitialized(4000..4001);
        let hs = handshake(&plc, 1);
        assert!(matches!(
            hs.acquire_write().await,
            Err(HandshakeError::NotReady { value: 0xFFFF, .. })
        ));
    }

    #[tokio::test]
    async fn test_open_write_channel_proceeds_and_resets() {
        let plc = SimulatedPlc::new();
        plc.set_word(4000, 1);
        let hs = handshake(&plc, 1);

        let turn = hs.acquire_write().await.unwrap();
        hs.registers()
            .client()
            .write(MemoryMap::standard().area, 1000, &[0x4142])
            .await
            .unwrap();
        hs.release_write(turn).await.unwrap();

        assert_eq!(plc.word(4000), 0);
        assert_eq!(plc.word(1000), 0x4142);
    }

    #[tokio::test]
    async fn test_read_and_failure_channels() {
        let plc = SimulatedPlc::new();
        let hs = handshake(&plc, 1);

        hs.mark_read_consumed(3).await.unwrap();
        assert_eq!(plc.word(4004), 1);
        assert!(hs.mark_read_consumed(10).await.is_err());

        assert!(hs.failure_report_pending().await.unwrap());
        hs.mark_failure_consumed().await.unwrap();
        assert_eq!(plc.word(4011), 1);
        assert!(!hs.failure_report_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_timeouts_are_retried() {
        let plc = SimulatedPlc::new();
        plc.set_word(4000, 1);
        plc.time_out_next(2);
        let hs = handshake(&plc, 3);

        let _turn = hs.acquire_write().await.unwrap();
        assert_eq!(plc.exchanges(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let plc = SimulatedPlc::new();
        plc.time_out_next(5);
        let hs = handshake(&plc, 2);

        let err = hs.failure_report_pending().await.unwrap_err();
        assert!(matches!(err, HandshakeError::Fins(FinsError::Timeout)));
        assert_eq!(plc.exchanges(), 2);
    }

    #[tokio::test]
    async fn test_protocol_errors_are_not_retried() {
        let plc = SimulatedPlc::new();
        plc.reject_writes(4011..4012, 0x2101);
        let hs = handshake(&plc, 5);

        assert!(hs.mark_failure_consumed().await.is_err());
        assert_eq!(plc.exchanges(), 1);
    }
}
