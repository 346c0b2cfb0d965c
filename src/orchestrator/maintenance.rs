//! Housekeeping tasks: health monitoring, event retention and the failure
//! slot scan.
//!
//! Health warnings are written to the event log once per condition; a record
//! that is still stale or still failed on the next run adds nothing.

use chrono::Utc;
use serde::Serialize;

use super::{Orchestrator, SyncError};
use crate::memory_map::SlotId;
use crate::registers::FaultReport;
use crate::store::EventLevel;

/// Outcome of a health check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    /// Active batches.
    pub active: usize,
    /// Unfinished work orders without recent telemetry.
    pub stale: Vec<String>,
    /// Work orders flagged as failed and still awaiting cancellation.
    pub failed: Vec<String>,
}

/// Outcome of an event retention run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    /// Event rows deleted.
    pub deleted: u64,
}

/// Outcome of a failure slot scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FaultScanReport {
    /// Whether the PLC had a report waiting.
    pub pending: bool,
    /// The report collected, if any.
    pub report: Option<FaultReport>,
}

impl Orchestrator {
    pub(super) async fn check_health(&self) -> Result<HealthReport, SyncError> {
        let active = self.store.list_active().await?;
        let now = Utc::now();
        let mut report = HealthReport {
            active: active.len(),
            ..Default::default()
        };

        for record in &active {
            if record.operation_failed && !record.manufacturing_complete {
                tracing::warn!(work_order = %record.work_order, "batch failed and not yet cancelled");
                self.warn_once(
                    "operation_failed",
                    &record.work_order,
                    "batch failed on PLC and awaits ERP cancellation",
                    None,
                )
                .await?;
                report.failed.push(record.work_order.clone());
                continue;
            }
            if record.manufacturing_complete {
                continue;
            }

            let last_seen = record.last_telemetry_at.unwrap_or(record.created_at);
            let age = now.signed_duration_since(last_seen);
            if age.to_std().is_ok_and(|age| age > self.settings.stale_after) {
                tracing::warn!(
                    work_order = %record.work_order,
                    age_secs = age.num_seconds(),
                    "no telemetry received"
                );
                let details = serde_json::json!({
                    "age_secs": age.num_seconds(),
                    "last_seen": last_seen.to_rfc3339(),
                });
                self.warn_once("stale_telemetry", &record.work_order, "no telemetry received", Some(&details))
                    .await?;
                report.stale.push(record.work_order.clone());
            }
        }

        Ok(report)
    }

    /// Records a warn event unless the newest event of `work_order` already
    /// has this `kind`.
    async fn warn_once(
        &self,
        kind: &str,
        work_order: &str,
        message: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<(), SyncError> {
        let latest = self.store.latest_event_for(work_order).await?;
        if latest.is_some_and(|event| event.kind == kind) {
            return Ok(());
        }
        self.store
            .record_event(EventLevel::Warn, kind, Some(work_order), message, details)
            .await?;
        Ok(())
    }

    pub(super) async fn prune(&self) -> Result<RetentionReport, SyncError> {
        let deleted = self
            .store
            .prune_events(self.settings.retention_days, self.settings.retention_keep_latest)
            .await?;
        if deleted > 0 {
            tracing::info!(deleted, "old events pruned");
        }
        Ok(RetentionReport { deleted })
    }

    pub(super) async fn scan_faults(&self) -> Result<FaultScanReport, SyncError> {
        if !self.handshake.failure_report_pending().await? {
            return Ok(FaultScanReport::default());
        }

        let reading = self.registers.read_slot(SlotId::Failure).await?;
        let fault = reading.fault_report();
        let details = serde_json::to_value(&fault).map_err(crate::store::StoreError::from)?;
        tracing::warn!(
            equipment = ?fault.equipment,
            code = ?fault.fault_code,
            text = ?fault.fault_text,
            "PLC reported a fault"
        );
        self.store
            .record_event(
                EventLevel::Warn,
                "plc_fault",
                None,
                fault.fault_text.as_deref().unwrap_or("PLC fault"),
                Some(&details),
            )
            .await?;
        self.handshake.mark_failure_consumed().await?;

        Ok(FaultScanReport {
            pending: true,
            report: Some(fault),
        })
    }
}
