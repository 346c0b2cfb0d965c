//! Batch lifecycle orchestration.
//!
//! The [`Orchestrator`] owns every collaborator (store, register service,
//! handshake coordinator, ERP client) and exposes one entry point per task.
//! Tasks coordinate only through persisted status bits and PLC handshake
//! flags. Each task also holds its own mutex for the duration of a run, so
//! a task never overlaps itself: a second trigger while a run is in
//! progress gets [`SyncError::Busy`].
//!
//! ```text
//! ERP order ──commit──▶ Active ──complete──▶ CompletePendingSync ──settle──▶ Archived(completed)
//!                         │
//!                         └──failed──▶ FailedPendingCancel ──cancel──▶ Archived(cancelled)
//! ```

mod intake;
mod maintenance;
mod settlement;
mod telemetry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::batch::{BatchRecord, BatchState, HistoryRecord, Outcome};
use crate::erp::{ErpClient, ErpError};
use crate::handshake::{Handshake, HandshakeError};
use crate::memory_map::MemoryMap;
use crate::registers::{EquipmentRegisters, RegisterError};
use crate::store::{BatchStore, StoreError};

pub use intake::{batch_from_order, IntakeReport};
pub use maintenance::{FaultScanReport, HealthReport, RetentionReport};
pub use settlement::{consumption_report, SettlementReport};
pub use telemetry::TelemetryReport;

/// Scheduled task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Fetch pending orders and stage them into the PLC.
    Intake,
    /// Read PLC execution progress into active batches.
    Telemetry,
    /// Report completed batches to the ERP.
    Settlement,
    /// Warn about stale or failed batches.
    Health,
    /// Prune old event rows.
    Retention,
    /// Collect PLC failure reports.
    FaultScan,
}

impl TaskKind {
    /// Every task, in scheduling order.
    pub const ALL: [TaskKind; 6] = [
        TaskKind::Intake,
        TaskKind::Telemetry,
        TaskKind::Settlement,
        TaskKind::Health,
        TaskKind::Retention,
        TaskKind::FaultScan,
    ];

    /// Task name as used on the command line and in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Intake => "intake",
            TaskKind::Telemetry => "telemetry",
            TaskKind::Settlement => "settlement",
            TaskKind::Health => "health",
            TaskKind::Retention => "retention",
            TaskKind::FaultScan => "fault-scan",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| SyncError::Invalid(format!("unknown task '{s}'")))
    }
}

/// Errors raised by orchestrator tasks and operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The task is already running.
    #[error("task {0} is already running")]
    Busy(TaskKind),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Slot access failure.
    #[error(transparent)]
    Register(#[from] RegisterError),

    /// Handshake failure.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// ERP failure.
    #[error(transparent)]
    Erp(#[from] ErpError),

    /// The ERP refused part of a consumption report.
    #[error("ERP rejected components {components:?} of {work_order}")]
    Rejected {
        /// Work order concerned.
        work_order: String,
        /// Refused product codes.
        components: Vec<String>,
    },

    /// The request does not apply to the batch's current state.
    #[error("{0}")]
    Invalid(String),
}

/// Tunables used by the tasks.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Maximum orders fetched per intake.
    pub page_size: u32,
    /// Component equipment prefix marking liquid lines.
    pub liquid_prefix: String,
    /// Age after which missing telemetry is reported.
    pub stale_after: Duration,
    /// Event rows older than this many days are pruned.
    pub retention_days: u32,
    /// Event rows always kept regardless of age.
    pub retention_keep_latest: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            page_size: 30,
            liquid_prefix: "LIQ".to_string(),
            stale_after: Duration::from_secs(600),
            retention_days: 30,
            retention_keep_latest: 1000,
        }
    }
}

/// Report of one task run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskReport {
    /// Intake run.
    Intake(IntakeReport),
    /// Telemetry sync run.
    Telemetry(TelemetryReport),
    /// Settlement run.
    Settlement(SettlementReport),
    /// Health check run.
    Health(HealthReport),
    /// Retention run.
    Retention(RetentionReport),
    /// Fault scan run.
    FaultScan(FaultScanReport),
}

#[derive(Debug, Default)]
struct TaskLocks {
    intake: Mutex<()>,
    telemetry: Mutex<()>,
    settlement: Mutex<()>,
    health: Mutex<()>,
    retention: Mutex<()>,
    fault_scan: Mutex<()>,
}

/// Drives batches through their lifecycle.
pub struct Orchestrator {
    store: BatchStore,
    registers: EquipmentRegisters,
    handshake: Handshake,
    erp: Arc<dyn ErpClient>,
    settings: OrchestratorSettings,
    locks: TaskLocks,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registers", &self.registers)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Wires the orchestrator.
    pub fn new(
        store: BatchStore,
        handshake: Handshake,
        erp: Arc<dyn ErpClient>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            registers: handshake.registers().clone(),
            handshake,
            erp,
            settings,
            locks: TaskLocks::default(),
        }
    }

    /// The batch store.
    pub fn store(&self) -> &BatchStore {
        &self.store
    }

    /// The task tunables.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// The slot layout in use.
    pub fn memory_map(&self) -> &MemoryMap {
        self.registers.map()
    }

    fn guard(&self, kind: TaskKind) -> Result<MutexGuard<'_, ()>, SyncError> {
        let lock = match kind {
            TaskKind::Intake => &self.locks.intake,
            TaskKind::Telemetry => &self.locks.telemetry,
            TaskKind::Settlement => &self.locks.settlement,
            TaskKind::Health => &self.locks.health,
            TaskKind::Retention => &self.locks.retention,
            TaskKind::FaultScan => &self.locks.fault_scan,
        };
        lock.try_lock().map_err(|_| SyncError::Busy(kind))
    }

    /// Runs one task now.
    pub async fn trigger(&self, kind: TaskKind) -> Result<TaskReport, SyncError> {
        let report = match kind {
            TaskKind::Intake => TaskReport::Intake(self.run_intake().await?),
            TaskKind::Telemetry => TaskReport::Telemetry(self.run_telemetry_sync().await?),
            TaskKind::Settlement => TaskReport::Settlement(self.run_settlement().await?),
            TaskKind::Health => TaskReport::Health(self.run_health_check().await?),
            TaskKind::Retention => TaskReport::Retention(self.run_retention().await?),
            TaskKind::FaultScan => TaskReport::FaultScan(self.run_fault_scan().await?),
        };
        Ok(report)
    }

    /// Fetches pending orders and stages them into the PLC.
    pub async fn run_intake(&self) -> Result<IntakeReport, SyncError> {
        let _guard = self.guard(TaskKind::Intake)?;
        self.intake().await
    }

    /// Reads execution progress for every active batch.
    pub async fn run_telemetry_sync(&self) -> Result<TelemetryReport, SyncError> {
        let _guard = self.guard(TaskKind::Telemetry)?;
        self.sync_telemetry().await
    }

    /// Reports completed batches to the ERP and archives them.
    pub async fn run_settlement(&self) -> Result<SettlementReport, SyncError> {
        let _guard = self.guard(TaskKind::Settlement)?;
        self.settle_completed().await
    }

    /// Warns about stale and failed batches.
    pub async fn run_health_check(&self) -> Result<HealthReport, SyncError> {
        let _guard = self.guard(TaskKind::Health)?;
        self.check_health().await
    }

    /// Prunes old event rows.
    pub async fn run_retention(&self) -> Result<RetentionReport, SyncError> {
        let _guard = self.guard(TaskKind::Retention)?;
        self.prune().await
    }

    /// Collects a pending PLC failure report.
    pub async fn run_fault_scan(&self) -> Result<FaultScanReport, SyncError> {
        let _guard = self.guard(TaskKind::FaultScan)?;
        self.scan_faults().await
    }

    /// Cancels a failed batch in the ERP (unless already acknowledged) and
    /// archives it as cancelled.
    ///
    /// The acknowledgement is persisted before archival, so a failed
    /// archive is retried later without a second ERP call.
    async fn fail_batch(&self, record: &BatchRecord, notes: &str) -> Result<HistoryRecord, SyncError> {
        if record.erp_cancel_acked {
            tracing::debug!(work_order = %record.work_order, "ERP cancel already acknowledged");
        } else {
            self.erp.cancel_order(&record.work_order).await?;
            self.store.set_cancel_acked(record.id).await?;
            tracing::info!(work_order = %record.work_order, "work order cancelled in ERP");
        }
        Ok(self.store.archive(record.id, Outcome::Cancelled, Some(notes)).await?)
    }

    /// Active batches.
    pub async fn current_batches(&self) -> Result<Vec<BatchRecord>, SyncError> {
        Ok(self.store.list_active().await?)
    }

    /// Active batches the PLC reported as failed.
    pub async fn failed_batches(&self) -> Result<Vec<BatchRecord>, SyncError> {
        Ok(self.store.list_failed().await?)
    }

    /// Most recent archived batches.
    pub async fn history(&self, limit: u32) -> Result<Vec<HistoryRecord>, SyncError> {
        Ok(self.store.history(limit).await?)
    }

    /// Archives every active batch as failed.
    ///
    /// Refused while intake, telemetry or settlement is running.
    pub async fn clear_active(&self) -> Result<u64, SyncError> {
        let _intake = self.guard(TaskKind::Intake)?;
        let _telemetry = self.guard(TaskKind::Telemetry)?;
        let _settlement = self.guard(TaskKind::Settlement)?;
        Ok(self.store.clear_active("cleared by operator").await?)
    }

    /// Re-runs the pending transition of one batch: settlement for a
    /// completed batch, cancellation for a failed one.
    pub async fn retry_batch(&self, work_order: &str) -> Result<HistoryRecord, SyncError> {
        let record = self.store.find_by_work_order(work_order).await?;
        match record.state() {
            BatchState::CompletePendingSync => {
                let _guard = self.guard(TaskKind::Settlement)?;
                self.settle_one(&record).await
            }
            BatchState::FailedPendingCancel => {
                let _guard = self.guard(TaskKind::Telemetry)?;
                self.fail_batch(&record, "operation failed on PLC (retried)").await
            }
            BatchState::Active => Err(SyncError::Invalid(format!(
                "{work_order} is still executing; nothing to retry"
            ))),
        }
    }

    /// Cancels an unfinished batch on operator request.
    pub async fn cancel_batch(&self, work_order: &str) -> Result<HistoryRecord, SyncError> {
        let _guard = self.guard(TaskKind::Telemetry)?;
        let mut record = self.store.find_by_work_order(work_order).await?;
        if !self.store.mark_operation_failed(record.id).await? {
            return Err(SyncError::Invalid(format!(
                "{work_order} is already complete and cannot be cancelled"
            )));
        }
        record.operation_failed = true;
        self.fail_batch(&record, "cancelled by operator").await
    }
}
