//! Typed slot access on top of the FINS client.
//!
//! [`EquipmentRegisters`] turns a [`SlotOrder`] into one area write per field
//! and a whole read slot into one area read, decoding every field on the way
//! back. Field-level problems (a value that does not fit, a definition the
//! template lacks) fail only that field and are collected in the report.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::batch::{ComponentKind, NewBatch, Telemetry};
use crate::client::FinsClient;
use crate::error::FinsError;
use crate::marshal::{self, DataType, FieldValue, MarshalError, Reading};
use crate::memory_map::{FieldDefinition, FieldKey, MemoryMap, SlotId, SlotTemplate};

/// Errors raised by the register service.
#[derive(Debug, Error)]
pub enum RegisterError {
    /// The exchange itself failed.
    #[error(transparent)]
    Fins(#[from] FinsError),

    /// One field could not be marshalled.
    #[error("field {key}: {source}")]
    Marshal {
        /// Field concerned.
        key: FieldKey,
        /// Underlying marshalling error.
        source: MarshalError,
    },

    /// The slot template has no definition for the field.
    #[error("field {0} is not defined for this slot")]
    MissingField(FieldKey),

    /// Text longer than the field; the PLC would only see a prefix of it.
    #[error("field {key}: {len} characters exceed the {chars}-character field")]
    TextTooLong {
        /// Field concerned.
        key: FieldKey,
        /// Characters supplied.
        len: usize,
        /// Characters the field holds.
        chars: u16,
    },

    /// More components than the slot has positions for.
    #[error("{count} {kind:?} components exceed the {capacity} slot positions")]
    TooManyComponents {
        /// Solid or liquid.
        kind: ComponentKind,
        /// Components supplied.
        count: usize,
        /// Positions available.
        capacity: u8,
    },

    /// Not every field of a slot was written.
    #[error("partial write: {written}/{total} fields written, first failure: {first}")]
    PartialWrite {
        /// Fields written.
        written: usize,
        /// Fields attempted.
        total: usize,
        /// Description of the first failed field.
        first: String,
    },
}

/// Order payload written into one write slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotOrder {
    /// ERP work order.
    pub work_order: String,
    /// Target equipment.
    pub equipment: String,
    /// 1-based queue position.
    pub batch_number: u16,
    /// Planned finished weight.
    pub target_weight: f64,
    /// Planned solid quantities by position.
    pub solid: Vec<f64>,
    /// Planned liquid quantities by position.
    pub liquid: Vec<f64>,
}

impl SlotOrder {
    /// Builds the slot payload for a staged batch.
    pub fn from_batch(batch: &NewBatch) -> Self {
        let planned = |kind: ComponentKind| -> Vec<f64> {
            let mut lines: Vec<_> = batch.components.iter().filter(|c| c.kind == kind).collect();
            lines.sort_by_key(|c| c.index);
            lines.into_iter().map(|c| c.planned).collect()
        };
        Self {
            work_order: batch.work_order.clone(),
            equipment: batch.equipment.clone(),
            batch_number: batch.batch_number,
            target_weight: batch.target_weight,
            solid: planned(ComponentKind::Solid),
            liquid: planned(ComponentKind::Liquid),
        }
    }

    fn check_capacity(&self) -> Result<(), RegisterError> {
        for (kind, count) in [
            (ComponentKind::Solid, self.solid.len()),
            (ComponentKind::Liquid, self.liquid.len()),
        ] {
            if count > kind.capacity() as usize {
                return Err(RegisterError::TooManyComponents {
                    kind,
                    count,
                    capacity: kind.capacity(),
                });
            }
        }
        Ok(())
    }

    /// Encodes every field against `template` without touching the PLC.
    ///
    /// # Errors
    ///
    /// Returns the first field that would fail in
    /// [`EquipmentRegisters::write_slot`].
    pub fn check_encodable(&self, template: &SlotTemplate) -> Result<(), RegisterError> {
        self.check_capacity()?;
        for (key, value) in self.field_values() {
            let field = template.field(key).ok_or(RegisterError::MissingField(key))?;
            encode_field(field, &value)?;
        }
        Ok(())
    }

    /// Every field value of the slot. Unused component positions are zero.
    pub fn field_values(&self) -> Vec<(FieldKey, FieldValue)> {
        let mut values = vec![
            (FieldKey::WorkOrder, FieldValue::Text(self.work_order.clone())),
            (FieldKey::Equipment, FieldValue::Text(self.equipment.clone())),
            (FieldKey::BatchNumber, FieldValue::Bcd(self.batch_number)),
            (FieldKey::TargetWeight, FieldValue::Real(self.target_weight)),
        ];
        for (kind, planned) in [
            (ComponentKind::Solid, &self.solid),
            (ComponentKind::Liquid, &self.liquid),
        ] {
            for n in 1..=kind.capacity() {
                let quantity = planned.get(n as usize - 1).copied().unwrap_or(0.0);
                values.push((kind.planned_key(n), FieldValue::Real(quantity)));
            }
        }
        let count = (self.solid.len() + self.liquid.len()) as u16;
        values.push((FieldKey::ComponentCount, FieldValue::Bcd(count)));
        values
    }
}

/// Failure report read from the failure slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FaultReport {
    /// Equipment that failed.
    pub equipment: Option<String>,
    /// PLC fault code.
    pub fault_code: Option<u16>,
    /// Fault description.
    pub fault_text: Option<String>,
    /// Downtime in minutes.
    pub downtime_minutes: Option<f64>,
}

/// Decoded contents of one slot.
#[derive(Debug, Clone)]
pub struct SlotReading {
    /// Slot read.
    pub slot: SlotId,
    /// Successfully decoded fields.
    pub readings: BTreeMap<FieldKey, Reading>,
    /// Fields that failed to decode.
    pub failures: Vec<(FieldKey, MarshalError)>,
}

impl SlotReading {
    /// Returns the reading of `key`, if it decoded.
    pub fn get(&self, key: FieldKey) -> Option<&Reading> {
        self.readings.get(&key)
    }

    fn real(&self, key: FieldKey) -> Option<f64> {
        self.get(key).and_then(Reading::as_real)
    }

    fn text(&self, key: FieldKey) -> Option<String> {
        self.get(key).and_then(Reading::as_text).map(str::to_string)
    }

    fn bcd(&self, key: FieldKey) -> Option<u16> {
        self.get(key).and_then(Reading::as_bcd)
    }

    fn flag(&self, key: FieldKey) -> Option<bool> {
        self.get(key).and_then(Reading::as_bool)
    }

    /// Assembles telemetry from a read slot.
    pub fn telemetry(&self) -> Telemetry {
        let mut actuals = Vec::new();
        for kind in [ComponentKind::Solid, ComponentKind::Liquid] {
            for n in 1..=kind.capacity() {
                if let Some(quantity) = self.real(kind.actual_key(n)) {
                    actuals.push((kind, n, quantity));
                }
            }
        }
        Telemetry {
            work_order: self.text(FieldKey::WorkOrder),
            batch_number: self.bcd(FieldKey::BatchNumber),
            manufacturing_complete: self.flag(FieldKey::ManufacturingComplete),
            operation_failed: self.flag(FieldKey::OperationFailed),
            actual_weight: self.real(FieldKey::ActualWeight),
            actuals,
            progress: self.real(FieldKey::Progress),
            stage_code: self.bcd(FieldKey::StageCode),
        }
    }

    /// Assembles a fault report from the failure slot.
    pub fn fault_report(&self) -> FaultReport {
        FaultReport {
            equipment: self.text(FieldKey::Equipment),
            fault_code: self.bcd(FieldKey::FaultCode),
            fault_text: self.text(FieldKey::FaultText),
            downtime_minutes: self.real(FieldKey::Downtime),
        }
    }
}

/// One field that could not be written.
#[derive(Debug, Clone, Serialize)]
pub struct FieldFailure {
    /// Field concerned.
    pub key: FieldKey,
    /// What went wrong.
    pub error: String,
}

/// Outcome of writing one slot.
#[derive(Debug, Clone, Serialize)]
pub struct WriteReport {
    /// Slot written.
    pub slot: SlotId,
    /// Fields attempted.
    pub total: usize,
    /// Fields written.
    pub written: usize,
    /// Fields that failed.
    pub failures: Vec<FieldFailure>,
}

impl WriteReport {
    /// Returns whether every field was written.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.written == self.total
    }

    /// Turns any failed field into [`RegisterError::PartialWrite`].
    pub fn into_result(self) -> Result<Self, RegisterError> {
        match self.failures.first() {
            None => Ok(self),
            Some(first) => Err(RegisterError::PartialWrite {
                written: self.written,
                total: self.total,
                first: format!("{}: {}", first.key, first.error),
            }),
        }
    }
}

/// Slot-level reads and writes against one PLC.
#[derive(Debug, Clone)]
pub struct EquipmentRegisters {
    client: Arc<FinsClient>,
    map: Arc<MemoryMap>,
}

impl EquipmentRegisters {
    /// Creates the service.
    pub fn new(client: Arc<FinsClient>, map: Arc<MemoryMap>) -> Self {
        Self { client, map }
    }

    /// The memory map in use.
    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    /// The underlying client.
    pub fn client(&self) -> &FinsClient {
        &self.client
    }

    /// Reads a slot in one exchange and decodes every field.
    ///
    /// # Errors
    ///
    /// Returns an error only when the exchange fails; decode problems are
    /// collected in [`SlotReading::failures`].
    pub async fn read_slot(&self, slot: SlotId) -> Result<SlotReading, RegisterError> {
        let range = self.map.slot_range(slot)?;
        let words = self
            .client
            .read(self.map.area, range.start, range.end - range.start)
            .await?;

        let mut readings = BTreeMap::new();
        let mut failures = Vec::new();
        for field in &self.map.template(slot).fields {
            let raw = &words[field.offset as usize..field.end() as usize];
            match marshal::decode(field.data_type, raw) {
                Ok(reading) => {
                    readings.insert(field.key, reading);
                }
                Err(e) => {
                    tracing::warn!(%slot, field = %field.key, error = %e, "field decode failed");
                    failures.push((field.key, e));
                }
            }
        }
        tracing::debug!(%slot, fields = readings.len(), failed = failures.len(), "slot read");

        Ok(SlotReading {
            slot,
            readings,
            failures,
        })
    }

    /// Writes `order` into write slot `index`, one exchange per field.
    ///
    /// # Errors
    ///
    /// Returns an error before any exchange if the slot index is out of range
    /// or the order has more components than the slot holds. Field-level
    /// failures are reported in the returned [`WriteReport`].
    pub async fn write_slot(&self, index: u8, order: &SlotOrder) -> Result<WriteReport, RegisterError> {
        let slot = SlotId::Write(index);
        let base = self.map.slot_base(slot)?;
        order.check_capacity()?;

        let values = order.field_values();
        let mut report = WriteReport {
            slot,
            total: values.len(),
            written: 0,
            failures: Vec::new(),
        };

        for (key, value) in values {
            match self.write_field(slot, base, key, &value).await {
                Ok(()) => report.written += 1,
                Err(e) => {
                    tracing::warn!(%slot, field = %key, error = %e, "field write failed");
                    report.failures.push(FieldFailure {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::debug!(
            %slot,
            work_order = %order.work_order,
            written = report.written,
            total = report.total,
            "slot written"
        );
        Ok(report)
    }

    async fn write_field(
        &self,
        slot: SlotId,
        base: u16,
        key: FieldKey,
        value: &FieldValue,
    ) -> Result<(), RegisterError> {
        let field = self
            .map
            .template(slot)
            .field(key)
            .ok_or(RegisterError::MissingField(key))?;
        let words = encode_field(field, value)?;
        self.client
            .write(self.map.area, base + field.offset, &words)
            .await?;
        Ok(())
    }
}

fn encode_field(field: &FieldDefinition, value: &FieldValue) -> Result<Vec<u16>, RegisterError> {
    if let (DataType::Ascii { chars }, FieldValue::Text(text)) = (field.data_type, value) {
        if text.chars().count() > chars as usize {
            return Err(RegisterError::TextTooLong {
                key: field.key,
                len: text.chars().count(),
                chars,
            });
        }
    }
    marshal::encode(field.data_type, field.words, value).map_err(|source| RegisterError::Marshal {
        key: field.key,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ComponentLine;
    use crate::header::NodeAddress;
    use crate::sim::SimulatedPlc;

    fn registers(plc: &SimulatedPlc) -> EquipmentRegisters {
        let client = FinsClient::new(plc.clone(), NodeAddress::new(0, 1, 0), NodeAddress::new(0, 10, 0));
        EquipmentRegisters::new(Arc::new(client), Arc::new(MemoryMap::standard()))
    }

    fn order() -> SlotOrder {
        SlotOrder {
            work_order: "WO-7".into(),
            equipment: "MIX01".into(),
            batch_number: 2,
            target_weight: 1500.25,
            solid: vec![1000.0, 250.5],
            liquid: vec![249.75],
        }
    }

    #[test]
    fn test_from_batch_orders_positions() {
        let line = |kind, index, planned| ComponentLine {
            kind,
            index,
            code: format!("P{index}"),
            name: None,
            planned,
            actual: None,
        };
        let batch = NewBatch {
            batch_number: 1,
            work_order: "WO-1".into(),
            equipment: "MIX01".into(),
            target_weight: 30.0,
            components: vec![
                line(ComponentKind::Solid, 2, 20.0),
                line(ComponentKind::Liquid, 1, 5.0),
                line(ComponentKind::Solid, 1, 10.0),
            ],
        };
        let order = SlotOrder::from_batch(&batch);
        assert_eq!(order.solid, vec![10.0, 20.0]);
        assert_eq!(order.liquid, vec![5.0]);
    }

    #[test]
    fn test_field_values_zero_unused_positions() {
        let values = order().field_values();
        assert_eq!(values.len(), 20);
        assert!(values.contains(&(FieldKey::SolidPlanned(13), FieldValue::Real(0.0))));
        assert!(values.contains(&(FieldKey::LiquidPlanned(2), FieldValue::Real(0.0))));
        assert!(values.contains(&(FieldKey::ComponentCount, FieldValue::Bcd(3))));
    }

    #[tokio::test]
    async fn test_write_slot_places_fields() {
        let plc = SimulatedPlc::new();
        let regs = registers(&plc);

        let report = regs.write_slot(1, &order()).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.written, 20);

        // Slot 1 starts at D1050.
        assert_eq!(plc.words(1050, 2), vec![0x574F, 0x2D37]);
        assert_eq!(plc.word(1065), 0x0002);
        assert_eq!(plc.words(1066, 2), vec![0x0002, 0x49F1]);
        assert_eq!(plc.word(1098), 0x0003);
    }

    #[tokio::test]
    async fn test_stale_slot_contents_are_overwritten() {
        let plc = SimulatedPlc::new();
        plc.fill_uninitialized(1000..1049);
        let regs = registers(&plc);

        regs.write_slot(0, &order()).await.unwrap().into_result().unwrap();
        // Solid position 13 was never part of the order.
        assert_eq!(plc.words(1042, 2), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_partial_write_is_reported() {
        let plc = SimulatedPlc::new();
        plc.reject_writes(1016..1018, 0x2101);
        let regs = registers(&plc);

        let report = regs.write_slot(0, &order()).await.unwrap();
        assert_eq!(report.written, 19);
        assert_eq!(report.failures[0].key, FieldKey::TargetWeight);
        match report.into_result().unwrap_err() {
            RegisterError::PartialWrite { written, total, first } => {
                assert_eq!((written, total), (19, 20));
                assert!(first.starts_with("target_weight"), "{first}");
            }
            other => panic!("expected partial write, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_out_of_range_value_fails_one_field() {
        let plc = SimulatedPlc::new();
        let regs = registers(&plc);
        let mut order = order();
        order.batch_number = 12_000;

        let report = regs.write_slot(0, &order).await.unwrap();
        assert_eq!(report.written, 19);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, FieldKey::BatchNumber);
    }

    #[test]
    fn test_check_encodable_matches_write_failures() {
        let map = MemoryMap::standard();
        assert!(order().check_encodable(&map.write_template).is_ok());

        let mut long = order();
        long.work_order = "WH/MO/2026/10/000123-A".into();
        match long.check_encodable(&map.write_template).unwrap_err() {
            RegisterError::TextTooLong { key, len, chars } => {
                assert_eq!(key, FieldKey::WorkOrder);
                assert_eq!((len, chars), (22, 20));
            }
            other => panic!("expected text too long, got {other:?}"),
        }

        let mut huge = order();
        huge.target_weight = 5e7;
        let err = huge.check_encodable(&map.write_template).unwrap_err();
        assert!(matches!(err, RegisterError::Marshal { key: FieldKey::TargetWeight, .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_long_text_fails_field_instead_of_truncating() {
        let plc = SimulatedPlc::new();
        let regs = registers(&plc);
        let mut order = order();
        order.equipment = "MIXER-LINE-04".into();

        let report = regs.write_slot(0, &order).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, FieldKey::Equipment);
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_too_many_components_rejected_before_io() {
        let plc = SimulatedPlc::new();
        let regs = registers(&plc);
        let mut order = order();
        order.liquid = vec![1.0, 2.0, 3.0];

        let err = regs.write_slot(0, &order).await.unwrap_err();
        assert!(matches!(err, RegisterError::TooManyComponents { .. }));
        assert_eq!(plc.exchanges(), 0);
    }

    #[tokio::test]
    async fn test_read_slot_uses_one_exchange() {
        let plc = SimulatedPlc::new();
        plc.fill_uninitialized(3000..3047);
        plc.set_words(3000, &[0x574F, 0x2D37]);
        for address in 3002..3010 {
            plc.set_word(address, 0);
        }
        plc.set_words(3010, &[0x0002, 0x0001, 0x0000]);
        plc.set_words(3013, &[0x0002, 0x49F1]);
        plc.set_word(3045, 485);
        let regs = registers(&plc);

        let reading = regs.read_slot(SlotId::Read(0)).await.unwrap();
        assert_eq!(plc.exchanges(), 1);
        assert!(reading.failures.is_empty());

        let telemetry = reading.telemetry();
        assert_eq!(telemetry.work_order.as_deref(), Some("WO-7"));
        assert_eq!(telemetry.batch_number, Some(2));
        assert_eq!(telemetry.manufacturing_complete, Some(true));
        assert_eq!(telemetry.operation_failed, Some(false));
        assert_eq!(telemetry.actual_weight, Some(1500.25));
        assert_eq!(telemetry.progress, Some(48.5));
        assert_eq!(telemetry.stage_code, None);
        assert!(telemetry.actuals.is_empty());
    }

    #[tokio::test]
    async fn test_bad_bcd_fails_only_that_field() {
        let plc = SimulatedPlc::new();
        plc.set_word(3010, 0x00AB);
        let regs = registers(&plc);

        let reading = regs.read_slot(SlotId::Read(0)).await.unwrap();
        assert_eq!(reading.failures.len(), 1);
        assert_eq!(reading.failures[0].0, FieldKey::BatchNumber);
        assert_eq!(reading.telemetry().operation_failed, Some(false));
    }

    #[tokio::test]
    async fn test_fault_report() {
        let plc = SimulatedPlc::new();
        plc.set_words(3600, &[0x4D49, 0x5830, 0x3100, 0, 0]);
        plc.set_word(3605, 0x0042);
        plc.set_words(3606, &[0x4A41, 0x4D00]);
        plc.set_word(3622, 125);
        let regs = registers(&plc);

        let report = regs.read_slot(SlotId::Failure).await.unwrap().fault_report();
        assert_eq!(report.equipment.as_deref(), Some("MIX01"));
        assert_eq!(report.fault_code, Some(42));
        assert_eq!(report.fault_text.as_deref(), Some("JAM"));
        assert_eq!(report.downtime_minutes, Some(12.5));
    }
}
