//! Telemetry sync: every active batch is matched against its read slot.
//!
//! Batch `n` reports through read slot `(n - 1) % 10`, and the slot counts
//! only while it echoes the batch's work order. A PLC-reported failure
//! branches into ERP cancellation.

use serde::Serialize;

use super::{Orchestrator, SyncError};
use crate::batch::{BatchRecord, UpdateOutcome};
use crate::memory_map::SlotId;

/// Outcome of a telemetry sync run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetryReport {
    /// Active batches examined.
    pub examined: usize,
    /// Batches whose telemetry changed.
    pub updated: usize,
    /// Batches read without change.
    pub unchanged: usize,
    /// Completed batches left alone.
    pub frozen: usize,
    /// Batches whose read slot reports another work order.
    pub mismatched: usize,
    /// Work orders cancelled and archived.
    pub cancelled: Vec<String>,
    /// Per-batch failures; the run continues past them.
    pub errors: Vec<String>,
}

enum RecordSync {
    Updated,
    Unchanged,
    Frozen,
    Mismatch,
}

impl Orchestrator {
    /// Read slot carrying batch `batch_number`.
    fn read_slot_for(&self, batch_number: u16) -> u8 {
        let slots = u16::from(self.registers.map().read_slots.max(1));
        (batch_number.saturating_sub(1) % slots) as u8
    }

    pub(super) async fn sync_telemetry(&self) -> Result<TelemetryReport, SyncError> {
        let mut report = TelemetryReport::default();

        for mut record in self.store.list_active().await? {
            report.examined += 1;
            if record.manufacturing_complete {
                report.frozen += 1;
                continue;
            }

            if !record.operation_failed {
                match self.sync_record(&mut record).await {
                    Ok(RecordSync::Updated) => report.updated += 1,
                    Ok(RecordSync::Unchanged) => report.unchanged += 1,
                    Ok(RecordSync::Frozen) => report.frozen += 1,
                    Ok(RecordSync::Mismatch) => report.mismatched += 1,
                    Err(e) => {
                        tracing::warn!(work_order = %record.work_order, error = %e, "telemetry sync failed");
                        report.errors.push(format!("{}: {e}", record.work_order));
                        continue;
                    }
                }
            }

            if record.operation_failed && !record.manufacturing_complete {
                match self.fail_batch(&record, "operation failed on PLC").await {
                    Ok(_) => report.cancelled.push(record.work_order.clone()),
                    Err(e) => {
                        tracing::error!(work_order = %record.work_order, error = %e, "failed batch not settled");
                        report.errors.push(format!("{}: {e}", record.work_order));
                    }
                }
            }
        }

        if report.updated > 0 || !report.cancelled.is_empty() {
            tracing::info!(
                updated = report.updated,
                cancelled = report.cancelled.len(),
                "telemetry synced"
            );
        }
        Ok(report)
    }

    async fn sync_record(&self, record: &mut BatchRecord) -> Result<RecordSync, SyncError> {
        let slot = self.read_slot_for(record.batch_number);
        let reading = self.registers.read_slot(SlotId::Read(slot)).await?;
        let telemetry = reading.telemetry();

        if telemetry.work_order.as_deref() != Some(record.work_order.as_str()) {
            tracing::debug!(
                slot,
                expected = %record.work_order,
                reported = ?telemetry.work_order,
                "read slot holds another work order"
            );
            return Ok(RecordSync::Mismatch);
        }

        let outcome = match record.apply_telemetry(&telemetry) {
            UpdateOutcome::Frozen => RecordSync::Frozen,
            UpdateOutcome::Unchanged => {
                self.store.touch_telemetry(record.id).await?;
                RecordSync::Unchanged
            }
            UpdateOutcome::Changed(fields) => {
                if self.store.persist_telemetry(record).await? {
                    tracing::debug!(work_order = %record.work_order, ?fields, "telemetry applied");
                    if record.manufacturing_complete {
                        tracing::info!(work_order = %record.work_order, "batch complete on PLC");
                    }
                    RecordSync::Updated
                } else {
                    RecordSync::Frozen
                }
            }
        };

        self.handshake.mark_read_consumed(slot).await?;
        Ok(outcome)
    }
}
