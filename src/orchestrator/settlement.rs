//! Completion settlement with the ERP.

use serde::Serialize;

use super::{Orchestrator, SyncError};
use crate::batch::{BatchRecord, HistoryRecord};
use crate::erp::{ConsumptionLine, ConsumptionReport};
use crate::store::EventLevel;

/// Outcome of a settlement run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SettlementReport {
    /// Completed batches awaiting settlement.
    pub examined: usize,
    /// Work orders closed in the ERP and archived.
    pub settled: Vec<String>,
    /// Work orders whose consumption the ERP refused.
    pub rejected: Vec<String>,
    /// Other per-batch failures.
    pub errors: Vec<String>,
}

/// Builds the consumption report for a completed batch.
///
/// Lines without an actual reading are left out rather than reported as zero.
pub fn consumption_report(record: &BatchRecord) -> ConsumptionReport {
    let lines = record
        .components
        .iter()
        .filter_map(|line| {
            line.actual.map(|quantity| ConsumptionLine {
                product_code: line.code.clone(),
                quantity,
            })
        })
        .collect();
    ConsumptionReport {
        finished_weight: record.actual_weight,
        lines,
    }
}

impl Orchestrator {
    pub(super) async fn settle_completed(&self) -> Result<SettlementReport, SyncError> {
        let pending = self.store.list_pending_settlement().await?;
        let mut report = SettlementReport {
            examined: pending.len(),
            ..Default::default()
        };

        for record in &pending {
            match self.settle_one(record).await {
                Ok(history) => report.settled.push(history.batch.work_order),
                Err(SyncError::Rejected { work_order, .. }) => report.rejected.push(work_order),
                Err(e) => {
                    tracing::error!(work_order = %record.work_order, error = %e, "settlement failed");
                    report.errors.push(format!("{}: {e}", record.work_order));
                }
            }
        }

        if !pending.is_empty() {
            tracing::info!(
                settled = report.settled.len(),
                rejected = report.rejected.len(),
                failed = report.errors.len(),
                "settlement finished"
            );
        }
        Ok(report)
    }

    /// Pushes consumption, closes the work order and archives the batch.
    ///
    /// A partially refused push leaves the batch pending; the refusal is
    /// recorded as an event so an operator can correct the ERP side.
    pub(super) async fn settle_one(&self, record: &BatchRecord) -> Result<HistoryRecord, SyncError> {
        let consumption = consumption_report(record);
        let ack = self
            .erp
            .push_consumption(&record.work_order, &record.equipment, &consumption)
            .await?;

        if !ack.fully_accepted() {
            let details = serde_json::json!({
                "accepted": ack.accepted,
                "rejected_components": ack.rejected_components,
            });
            tracing::warn!(
                work_order = %record.work_order,
                rejected = ?ack.rejected_components,
                "ERP refused consumption"
            );
            self.store
                .record_event(
                    EventLevel::Warn,
                    "consumption_rejected",
                    Some(&record.work_order),
                    "ERP refused part of the consumption report",
                    Some(&details),
                )
                .await?;
            return Err(SyncError::Rejected {
                work_order: record.work_order.clone(),
                components: ack.rejected_components,
            });
        }

        self.erp
            .mark_done(&record.work_order, record.finished_quantity())
            .await?;
        let history = self.store.settle_and_archive(record.id, None).await?;
        tracing::info!(work_order = %record.work_order, "batch settled");
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::batch::{ComponentKind, ComponentLine};

    fn line(code: &str, actual: Option<f64>) -> ComponentLine {
        ComponentLine {
            kind: ComponentKind::Solid,
            index: 1,
            code: code.into(),
            name: None,
            planned: 5.0,
            actual,
        }
    }

    #[test]
    fn test_unread_components_are_omitted() {
        let record = BatchRecord {
            id: 1,
            batch_number: 1,
            work_order: "WO-7".into(),
            equipment: "MIX01".into(),
            components: vec![line("FLOUR", Some(4.75)), line("SALT", None)],
            target_weight: 10.0,
            actual_weight: Some(9.8),
            progress: Some(100.0),
            stage_code: None,
            manufacturing_complete: true,
            operation_failed: false,
            erp_synced: false,
            erp_cancel_acked: false,
            last_telemetry_at: None,
            created_at: Utc::now(),
        };

        let report = consumption_report(&record);
        assert_eq!(report.finished_weight, Some(9.8));
        assert_eq!(report.lines.len(), 1);
        assert_eq!(report.lines[0].product_code, "FLOUR");
        assert_eq!(report.lines[0].quantity, 4.75);
    }
}
