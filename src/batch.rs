//! Batch lifecycle entities.
//!
//! A [`BatchRecord`] is one batch in flight. Once the PLC has reported it
//! complete, its consumption data is frozen: [`BatchRecord::apply_telemetry`]
//! refuses to change it and reports [`UpdateOutcome::Frozen`]. The store
//! enforces the same rule with a guarded `UPDATE`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory_map::{FieldKey, LIQUID_COMPONENTS, SOLID_COMPONENTS};

/// Solid or liquid component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// Dosed by weight from a silo or hopper.
    Solid,
    /// Dosed from a liquid line.
    Liquid,
}

impl ComponentKind {
    /// Number of slot positions available for this kind.
    pub fn capacity(self) -> u8 {
        match self {
            ComponentKind::Solid => SOLID_COMPONENTS,
            ComponentKind::Liquid => LIQUID_COMPONENTS,
        }
    }

    /// Field holding the planned quantity of position `index`.
    pub fn planned_key(self, index: u8) -> FieldKey {
        match self {
            ComponentKind::Solid => FieldKey::SolidPlanned(index),
            ComponentKind::Liquid => FieldKey::LiquidPlanned(index),
        }
    }

    /// Field holding the consumed quantity of position `index`.
    pub fn actual_key(self, index: u8) -> FieldKey {
        match self {
            ComponentKind::Solid => FieldKey::SolidActual(index),
            ComponentKind::Liquid => FieldKey::LiquidActual(index),
        }
    }
}

/// One component of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentLine {
    /// Solid or liquid.
    pub kind: ComponentKind,
    /// 1-based position within its kind.
    pub index: u8,
    /// Product code.
    pub code: String,
    /// Product name, when the ERP supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Planned quantity.
    pub planned: f64,
    /// Consumed quantity reported by the PLC.
    #[serde(default)]
    pub actual: Option<f64>,
}

/// Lifecycle state derived from the status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// In the active table, executing on the PLC.
    Active,
    /// PLC finished it; ERP settlement outstanding.
    CompletePendingSync,
    /// PLC aborted it; ERP cancellation or archival outstanding.
    FailedPendingCancel,
}

/// Terminal outcome of an archived batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Settled with the ERP.
    Completed,
    /// Dropped without ERP settlement.
    Failed,
    /// Cancelled in the ERP after a PLC failure.
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => write!(f, "completed"),
            Outcome::Failed => write!(f, "failed"),
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Outcome::Completed),
            "failed" => Ok(Outcome::Failed),
            "cancelled" => Ok(Outcome::Cancelled),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// A batch about to be staged by intake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewBatch {
    /// 1-based position in the active queue.
    pub batch_number: u16,
    /// ERP work order.
    pub work_order: String,
    /// Equipment the batch runs on.
    pub equipment: String,
    /// Planned finished weight.
    pub target_weight: f64,
    /// Component lines, solids first.
    pub components: Vec<ComponentLine>,
}

/// Values decoded from a read slot; `None` means the PLC never wrote the field.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telemetry {
    /// Work order the PLC is reporting on.
    pub work_order: Option<String>,
    /// Batch number echoed by the PLC.
    pub batch_number: Option<u16>,
    /// Completion bit.
    pub manufacturing_complete: Option<bool>,
    /// Failure bit.
    pub operation_failed: Option<bool>,
    /// Finished weight.
    pub actual_weight: Option<f64>,
    /// Consumed quantities, keyed by kind and 1-based position.
    pub actuals: Vec<(ComponentKind, u8, f64)>,
    /// Completion percentage.
    pub progress: Option<f64>,
    /// Process stage.
    pub stage_code: Option<u16>,
}

/// Result of applying telemetry to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The record is complete; nothing may change.
    Frozen,
    /// Every reported value already matched.
    Unchanged,
    /// These fields changed.
    Changed(Vec<FieldKey>),
}

impl UpdateOutcome {
    /// Returns whether anything was modified.
    pub fn is_changed(&self) -> bool {
        matches!(self, UpdateOutcome::Changed(_))
    }
}

/// One batch in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRecord {
    /// Surrogate id.
    pub id: i64,
    /// 1-based position in the active queue.
    pub batch_number: u16,
    /// ERP work order.
    pub work_order: String,
    /// Equipment the batch runs on.
    pub equipment: String,
    /// Component lines.
    pub components: Vec<ComponentLine>,
    /// Planned finished weight.
    pub target_weight: f64,
    /// Finished weight reported by the PLC.
    pub actual_weight: Option<f64>,
    /// Last reported completion percentage.
    pub progress: Option<f64>,
    /// Last reported process stage.
    pub stage_code: Option<u16>,
    /// The PLC finished the batch.
    pub manufacturing_complete: bool,
    /// The PLC aborted the batch.
    pub operation_failed: bool,
    /// Consumption was accepted by the ERP.
    pub erp_synced: bool,
    /// The ERP acknowledged the cancellation.
    pub erp_cancel_acked: bool,
    /// When telemetry last changed the record.
    pub last_telemetry_at: Option<DateTime<Utc>>,
    /// When the record was staged.
    pub created_at: DateTime<Utc>,
}

impl BatchRecord {
    /// Current lifecycle state.
    pub fn state(&self) -> BatchState {
        if self.manufacturing_complete {
            BatchState::CompletePendingSync
        } else if self.operation_failed {
            BatchState::FailedPendingCancel
        } else {
            BatchState::Active
        }
    }

    /// Returns whether consumption data may no longer change.
    pub fn is_frozen(&self) -> bool {
        self.manufacturing_complete
    }

    /// Applies decoded telemetry, changing only values that differ.
    ///
    /// Uninitialized readings are ignored. Status bits latch: a PLC reading
    /// of `false` never clears a bit already set.
    pub fn apply_telemetry(&mut self, telemetry: &Telemetry) -> UpdateOutcome {
        if self.is_frozen() {
            return UpdateOutcome::Frozen;
        }

        let mut changed = Vec::new();

        if let Some(weight) = telemetry.actual_weight {
            if self.actual_weight != Some(weight) {
                self.actual_weight = Some(weight);
                changed.push(FieldKey::ActualWeight);
            }
        }
        for &(kind, index, quantity) in &telemetry.actuals {
            let line = self
                .components
                .iter_mut()
                .find(|c| c.kind == kind && c.index == index);
            if let Some(line) = line {
                if line.actual != Some(quantity) {
                    line.actual = Some(quantity);
                    changed.push(kind.actual_key(index));
                }
            }
        }
        if let Some(progress) = telemetry.progress {
            if self.progress != Some(progress) {
                self.progress = Some(progress);
                changed.push(FieldKey::Progress);
            }
        }
        if let Some(stage) = telemetry.stage_code {
            if self.stage_code != Some(stage) {
                self.stage_code = Some(stage);
                changed.push(FieldKey::StageCode);
            }
        }
        if telemetry.operation_failed == Some(true) && !self.operation_failed {
            self.operation_failed = true;
            changed.push(FieldKey::OperationFailed);
        }
        // Last, so the final consumption values land with the completion bit.
        if telemetry.manufacturing_complete == Some(true) {
            self.manufacturing_complete = true;
            changed.push(FieldKey::ManufacturingComplete);
        }

        if changed.is_empty() {
            UpdateOutcome::Unchanged
        } else {
            UpdateOutcome::Changed(changed)
        }
    }

    /// Finished quantity reported to the ERP: the measured weight when
    /// known, the planned one otherwise.
    pub fn finished_quantity(&self) -> f64 {
        self.actual_weight.unwrap_or(self.target_weight)
    }
}

/// Immutable archival copy of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    /// Archived batch as it was when it left the active table.
    #[serde(flatten)]
    pub batch: BatchRecord,
    /// Terminal outcome.
    pub outcome: Outcome,
    /// Free-text notes.
    pub notes: Option<String>,
    /// Archive time.
    pub archived_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> BatchRecord {
        BatchRecord {
            id: 1,
            batch_number: 1,
            work_order: "WO-1001".into(),
            equipment: "MIX01".into(),
            components: vec![
                ComponentLine {
                    kind: ComponentKind::Solid,
                    index: 1,
                    code: "FLOUR".into(),
                    name: Some("Wheat flour".into()),
                    planned: 500.0,
                    actual: None,
                },
                ComponentLine {
                    kind: ComponentKind::Liquid,
                    index: 1,
                    code: "WATER".into(),
                    name: None,
                    planned: 120.0,
                    actual: None,
                },
            ],
            target_weight: 620.0,
            actual_weight: None,
            progress: None,
            stage_code: None,
            manufacturing_complete: false,
            operation_failed: false,
            erp_synced: false,
            erp_cancel_acked: false,
            last_telemetry_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_apply_changes_only_differing_values() {
        let mut record = sample_record();
        let telemetry = Telemetry {
            actual_weight: Some(300.5),
            actuals: vec![(ComponentKind::Solid, 1, 250.0)],
            progress: Some(48.5),
            ..Default::default()
        };

        let outcome = record.apply_telemetry(&telemetry);
        assert_eq!(
            outcome,
            UpdateOutcome::Changed(vec![
                FieldKey::ActualWeight,
                FieldKey::SolidActual(1),
                FieldKey::Progress
            ])
        );
        assert_eq!(record.components[0].actual, Some(250.0));
        assert_eq!(record.apply_telemetry(&telemetry), UpdateOutcome::Unchanged);
    }

    #[test]
    fn test_uninitialized_fields_are_ignored() {
        let mut record = sample_record();
        record.actual_weight = Some(10.0);
        assert_eq!(
            record.apply_telemetry(&Telemetry::default()),
            UpdateOutcome::Unchanged
        );
        assert_eq!(record.actual_weight, Some(10.0));
    }

    #[test]
    fn test_frozen_record_reports_no_change() {
        let mut record = sample_record();
        record.manufacturing_complete = true;
        record.actual_weight = Some(618.0);

        let outcome = record.apply_telemetry(&Telemetry {
            actual_weight: Some(999.0),
            actuals: vec![(ComponentKind::Liquid, 1, 1.0)],
            ..Default::default()
        });
        assert_eq!(outcome, UpdateOutcome::Frozen);
        assert_eq!(record.actual_weight, Some(618.0));
        assert_eq!(record.components[1].actual, None);
    }

    #[test]
    fn test_completion_latches_with_final_values() {
        let mut record = sample_record();
        let outcome = record.apply_telemetry(&Telemetry {
            manufacturing_complete: Some(true),
            actual_weight: Some(619.0),
            ..Default::default()
        });
        assert!(outcome.is_changed());
        assert_eq!(record.state(), BatchState::CompletePendingSync);
        assert_eq!(record.finished_quantity(), 619.0);

        let outcome = record.apply_telemetry(&Telemetry {
            manufacturing_complete: Some(false),
            ..Default::default()
        });
        assert_eq!(outcome, UpdateOutcome::Frozen);
    }

    #[test]
    fn test_failure_bit_latches() {
        let mut record = sample_record();
        record.apply_telemetry(&Telemetry {
            operation_failed: Some(true),
            ..Default::default()
        });
        assert_eq!(record.state(), BatchState::FailedPendingCancel);
        record.apply_telemetry(&Telemetry {
            operation_failed: Some(false),
            ..Default::default()
        });
        assert!(record.operation_failed);
    }

    #[test]
    fn test_unknown_component_position_is_ignored() {
        let mut record = sample_record();
        let outcome = record.apply_telemetry(&Telemetry {
            actuals: vec![(ComponentKind::Solid, 9, 5.0)],
            ..Default::default()
        });
        assert_eq!(outcome, UpdateOutcome::Unchanged);
    }

    #[test]
    fn test_outcome_names() {
        for outcome in [Outcome::Completed, Outcome::Failed, Outcome::Cancelled] {
            assert_eq!(outcome.to_string().parse::<Outcome>().unwrap(), outcome);
        }
    }
}
