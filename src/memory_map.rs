//! Slot layout of the DM area shared with the PLC program.
//!
//! The map is pure data. It is built once at startup by
//! [`MemoryMap::standard`], validated, and shared read-only behind an `Arc`.
//!
//! | Region | Base | Slots | Stride |
//! |--------|------|-------|--------|
//! | Write slots (gateway → PLC) | D1000 | 30 | 50 |
//! | Read slots (PLC → gateway) | D3000 | 10 | 50 |
//! | Failure slot | D3600 | 1 | - |
//! | Write flag | D4000 | 1 | - |
//! | Read flags | D4001 | 10 | 1 |
//! | Failure flag | D4011 | 1 | - |

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

use serde::Serialize;

use crate::error::{FinsError, Result};
use crate::marshal::DataType;
use crate::memory::MemoryArea;

/// Layout revision; the PLC program must be built against the same one.
pub const LAYOUT_VERSION: u16 = 3;

/// Number of solid components carried per batch.
pub const SOLID_COMPONENTS: u8 = 13;

/// Number of liquid components carried per batch.
pub const LIQUID_COMPONENTS: u8 = 2;

/// Identifies one field inside a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldKey {
    /// ERP work order number.
    WorkOrder,
    /// Equipment (line) identifier.
    Equipment,
    /// Sequential batch number.
    BatchNumber,
    /// Planned total weight.
    TargetWeight,
    /// Planned quantity of solid component 1..=13.
    SolidPlanned(u8),
    /// Planned quantity of liquid component 1..=2.
    LiquidPlanned(u8),
    /// Number of components in use.
    ComponentCount,
    /// Set by the PLC when the batch is finished.
    ManufacturingComplete,
    /// Set by the PLC when the batch aborted.
    OperationFailed,
    /// Produced total weight.
    ActualWeight,
    /// Consumed quantity of solid component 1..=13.
    SolidActual(u8),
    /// Consumed quantity of liquid component 1..=2.
    LiquidActual(u8),
    /// Completion percentage.
    Progress,
    /// Current process stage.
    StageCode,
    /// Fault code of the failure report.
    FaultCode,
    /// Fault description.
    FaultText,
    /// Downtime in minutes.
    Downtime,
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKey::WorkOrder => write!(f, "work_order"),
            FieldKey::Equipment => write!(f, "equipment"),
            FieldKey::BatchNumber => write!(f, "batch_number"),
            FieldKey::TargetWeight => write!(f, "target_weight"),
            FieldKey::SolidPlanned(n) => write!(f, "solid_{n:02}_planned"),
            FieldKey::LiquidPlanned(n) => write!(f, "liquid_{n:02}_planned"),
            FieldKey::ComponentCount => write!(f, "component_count"),
            FieldKey::ManufacturingComplete => write!(f, "manufacturing_complete"),
            FieldKey::OperationFailed => write!(f, "operation_failed"),
            FieldKey::ActualWeight => write!(f, "actual_weight"),
            FieldKey::SolidActual(n) => write!(f, "solid_{n:02}_actual"),
            FieldKey::LiquidActual(n) => write!(f, "liquid_{n:02}_actual"),
            FieldKey::Progress => write!(f, "progress"),
            FieldKey::StageCode => write!(f, "stage_code"),
            FieldKey::FaultCode => write!(f, "fault_code"),
            FieldKey::FaultText => write!(f, "fault_text"),
            FieldKey::Downtime => write!(f, "downtime"),
        }
    }
}

impl Serialize for FieldKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One field of a slot template.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldDefinition {
    /// Field identity.
    pub key: FieldKey,
    /// Word offset from the slot base.
    pub offset: u16,
    /// Number of words occupied.
    pub words: u16,
    /// Encoding.
    #[serde(flatten)]
    pub data_type: DataType,
}

impl FieldDefinition {
    const fn new(key: FieldKey, offset: u16, words: u16, data_type: DataType) -> Self {
        Self {
            key,
            offset,
            words,
            data_type,
        }
    }

    /// Offset one past the last word.
    pub fn end(&self) -> u16 {
        self.offset + self.words
    }
}

/// Ordered field list shared by every slot of one kind.
#[derive(Debug, Clone, Serialize)]
pub struct SlotTemplate {
    /// Template name, used in logs.
    pub name: &'static str,
    /// Fields in ascending offset order.
    pub fields: Vec<FieldDefinition>,
}

impl SlotTemplate {
    /// Total words spanned by the template.
    pub fn span(&self) -> u16 {
        self.fields.iter().map(FieldDefinition::end).max().unwrap_or(0)
    }

    /// Looks a field up by key.
    pub fn field(&self, key: FieldKey) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.key == key)
    }
}

/// Identifies a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SlotId {
    /// Gateway → PLC order slot.
    Write(u8),
    /// PLC → gateway telemetry slot.
    Read(u8),
    /// PLC → gateway failure report.
    Failure,
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::Write(i) => write!(f, "write[{i}]"),
            SlotId::Read(i) => write!(f, "read[{i}]"),
            SlotId::Failure => write!(f, "failure"),
        }
    }
}

/// Complete slot layout plus handshake flag addresses.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryMap {
    /// Layout revision, [`LAYOUT_VERSION`] for the standard map.
    pub version: u16,
    /// Memory area every address refers to.
    pub area: MemoryArea,
    /// First write slot base address.
    pub write_base: u16,
    /// Number of write slots.
    pub write_slots: u8,
    /// First read slot base address.
    pub read_base: u16,
    /// Number of read slots.
    pub read_slots: u8,
    /// Distance between consecutive slot bases.
    pub slot_stride: u16,
    /// Failure slot base address.
    pub failure_base: u16,
    /// Write handshake flag.
    pub write_flag: u16,
    /// First read handshake flag; one per read slot.
    pub read_flag_base: u16,
    /// Failure handshake flag.
    pub failure_flag: u16,
    /// Write slot template.
    pub write_template: SlotTemplate,
    /// Read slot template.
    pub read_template: SlotTemplate,
    /// Failure slot template.
    pub failure_template: SlotTemplate,
}

fn real2(scale: f64) -> DataType {
    DataType::Real { scale }
}

fn write_template() -> SlotTemplate {
    let mut fields = vec![
        FieldDefinition::new(FieldKey::WorkOrder, 0, 10, DataType::Ascii { chars: 20 }),
        FieldDefinition::new(FieldKey::Equipment, 10, 5, DataType::Ascii { chars: 10 }),
        FieldDefinition::new(FieldKey::BatchNumber, 15, 1, DataType::Bcd { digits: 4 }),
        FieldDefinition::new(FieldKey::TargetWeight, 16, 2, real2(100.0)),
    ];
    let mut offset = 18;
    for n in 1..=SOLID_COMPONENTS {
        fields.push(FieldDefinition::new(FieldKey::SolidPlanned(n), offset, 2, real2(100.0)));
        offset += 2;
    }
    for n in 1..=LIQUID_COMPONENTS {
        fields.push(FieldDefinition::new(FieldKey::LiquidPlanned(n), offset, 2, real2(100.0)));
        offset += 2;
    }
    fields.push(FieldDefinition::new(FieldKey::ComponentCount, offset, 1, DataType::Bcd { digits: 2 }));
    SlotTemplate {
        name: "write",
        fields,
    }
}

fn read_template() -> SlotTemplate {
    let mut fields = vec![
        FieldDefinition::new(FieldKey::WorkOrder, 0, 10, DataType::Ascii { chars: 20 }),
        FieldDefinition::new(FieldKey::BatchNumber, 10, 1, DataType::Bcd { digits: 4 }),
        FieldDefinition::new(FieldKey::ManufacturingComplete, 11, 1, DataType::Boolean),
        FieldDefinition::new(FieldKey::OperationFailed, 12, 1, DataType::Boolean),
        FieldDefinition::new(FieldKey::ActualWeight, 13, 2, real2(100.0)),
    ];
    let mut offset = 15;
    for n in 1..=SOLID_COMPONENTS {
        fields.push(FieldDefinition::new(FieldKey::SolidActual(n), offset, 2, real2(100.0)));
        offset += 2;
    }
    for n in 1..=LIQUID_COMPONENTS {
        fields.push(FieldDefinition::new(FieldKey::LiquidActual(n), offset, 2, real2(100.0)));
        offset += 2;
    }
    fields.push(FieldDefinition::new(FieldKey::Progress, offset, 1, DataType::Real { scale: 10.0 }));
    fields.push(FieldDefinition::new(FieldKey::StageCode, offset + 1, 1, DataType::Bcd { digits: 2 }));
    SlotTemplate {
        name: "read",
        fields,
    }
}

fn failure_template() -> SlotTemplate {
    SlotTemplate {
        name: "failure",
        fields: vec![
            FieldDefinition::new(FieldKey::Equipment, 0, 5, DataType::Ascii { chars: 10 }),
            FieldDefinition::new(FieldKey::FaultCode, 5, 1, DataType::Bcd { digits: 4 }),
            FieldDefinition::new(FieldKey::FaultText, 6, 16, DataType::Ascii { chars: 32 }),
            FieldDefinition::new(FieldKey::Downtime, 22, 1, DataType::Real { scale: 10.0 }),
        ],
    }
}

impl MemoryMap {
    /// The layout the PLC program is built against.
    pub fn standard() -> Self {
        Self {
            version: LAYOUT_VERSION,
            area: MemoryArea::DM,
            write_base: 1000,
            write_slots: 30,
            read_base: 3000,
            read_slots: 10,
            slot_stride: 50,
            failure_base: 3600,
            write_flag: 4000,
            read_flag_base: 4001,
            failure_flag: 4011,
            write_template: write_template(),
            read_template: read_template(),
            failure_template: failure_template(),
        }
    }

    /// Returns the template used by `slot`.
    pub fn template(&self, slot: SlotId) -> &SlotTemplate {
        match slot {
            SlotId::Write(_) => &self.write_template,
            SlotId::Read(_) => &self.read_template,
            SlotId::Failure => &self.failure_template,
        }
    }

    /// Returns the base address of `slot`.
    ///
    /// # Errors
    ///
    /// Returns `FinsError::InvalidParameter` if the slot index is out of range.
    pub fn slot_base(&self, slot: SlotId) -> Result<u16> {
        match slot {
            SlotId::Write(i) if i < self.write_slots => {
                Ok(self.write_base + u16::from(i) * self.slot_stride)
            }
            SlotId::Read(i) if i < self.read_slots => {
                Ok(self.read_base + u16::from(i) * self.slot_stride)
            }
            SlotId::Failure => Ok(self.failure_base),
            other => Err(FinsError::invalid_parameter(
                "slot",
                format!("{other} is outside the map"),
            )),
        }
    }

    /// Address range occupied by `slot`.
    pub fn slot_range(&self, slot: SlotId) -> Result<Range<u16>> {
        let base = self.slot_base(slot)?;
        Ok(base..base + self.template(slot).span())
    }

    /// Looks up a field of `slot`'s template.
    pub fn field(&self, slot: SlotId, key: FieldKey) -> Result<&FieldDefinition> {
        self.template(slot).field(key).ok_or_else(|| {
            FinsError::invalid_parameter("field", format!("{key} is not part of the {} template", self.template(slot).name))
        })
    }

    /// Absolute address of `key` inside `slot`.
    pub fn address_of(&self, slot: SlotId, key: FieldKey) -> Result<u16> {
        Ok(self.slot_base(slot)? + self.field(slot, key)?.offset)
    }

    /// Handshake flag address guarding `slot`.
    ///
    /// All write slots share the single write flag.
    pub fn flag_address(&self, slot: SlotId) -> Result<u16> {
        match slot {
            SlotId::Write(_) => Ok(self.write_flag),
            SlotId::Read(i) if i < self.read_slots => Ok(self.read_flag_base + u16::from(i)),
            SlotId::Failure => Ok(self.failure_flag),
            other => Err(FinsError::invalid_parameter(
                "slot",
                format!("{other} has no flag"),
            )),
        }
    }

    fn all_slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        (0..self.write_slots)
            .map(SlotId::Write)
            .chain((0..self.read_slots).map(SlotId::Read))
            .chain(std::iter::once(SlotId::Failure))
    }

    /// Checks the layout for overlaps and malformed templates.
    ///
    /// Fields may not overlap inside a template and templates must fit the
    /// stride. No slot may share a word with another slot or a flag.
    ///
    /// # Errors
    ///
    /// Returns `FinsError::InvalidParameter` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        for template in [&self.write_template, &self.read_template, &self.failure_template] {
            validate_template(template)?;
        }
        for template in [&self.write_template, &self.read_template] {
            if template.span() > self.slot_stride {
                return Err(FinsError::invalid_parameter(
                    "memory_map",
                    format!(
                        "{} template spans {} words, more than the stride of {}",
                        template.name,
                        template.span(),
                        self.slot_stride
                    ),
                ));
            }
        }

        let mut used: HashSet<u32> = HashSet::new();
        let mut claim = |address: u32, owner: &dyn fmt::Display| -> Result<()> {
            if address > u32::from(u16::MAX) {
                return Err(FinsError::invalid_parameter(
                    "memory_map",
                    format!("{owner} runs past the end of the area"),
                ));
            }
            if !used.insert(address) {
                return Err(FinsError::invalid_parameter(
                    "memory_map",
                    format!("{owner} overlaps D{address}"),
                ));
            }
            Ok(())
        };

        for slot in self.all_slots() {
            let base = match slot {
                SlotId::Write(i) => u32::from(self.write_base) + u32::from(i) * u32::from(self.slot_stride),
                SlotId::Read(i) => u32::from(self.read_base) + u32::from(i) * u32::from(self.slot_stride),
                SlotId::Failure => u32::from(self.failure_base),
            };
            for offset in 0..u32::from(self.template(slot).span()) {
                claim(base + offset, &slot)?;
            }
        }
        claim(u32::from(self.write_flag), &"write flag")?;
        for i in 0..self.read_slots {
            claim(u32::from(self.read_flag_base) + u32::from(i), &SlotId::Read(i))?;
        }
        claim(u32::from(self.failure_flag), &"failure flag")?;
        Ok(())
    }
}

fn validate_template(template: &SlotTemplate) -> Result<()> {
    let mut keys = HashSet::new();
    let mut previous_end = 0u16;
    for field in &template.fields {
        let bad = |reason: String| {
            FinsError::invalid_parameter(
                "memory_map",
                format!("{} template, field {}: {reason}", template.name, field.key),
            )
        };
        if !keys.insert(field.key) {
            return Err(bad("duplicate key".into()));
        }
        if field.offset < previous_end {
            return Err(bad(format!("offset {} overlaps the previous field", field.offset)));
        }
        let width_ok = match field.data_type {
            DataType::Real { scale } => (field.words == 1 || field.words == 2) && scale > 0.0,
            DataType::Ascii { chars } => u16::try_from((chars as usize).div_ceil(2)) == Ok(field.words),
            DataType::Boolean => field.words == 1,
            DataType::Bcd { digits } => field.words == 1 && (digits == 2 || digits == 4),
        };
        if !width_ok {
            return Err(bad(format!("{} words do not fit a {} field", field.words, field.data_type.name())));
        }
        previous_end = field.end();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_map_is_valid() {
        MemoryMap::standard().validate().unwrap();
    }

    #[test]
    fn test_template_spans() {
        let map = MemoryMap::standard();
        assert_eq!(map.write_template.span(), 49);
        assert_eq!(map.read_template.span(), 47);
        assert_eq!(map.failure_template.span(), 23);
        assert_eq!(map.write_template.fields.len(), 20);
    }

    #[test]
    fn test_slot_addresses() {
        let map = MemoryMap::standard();
        assert_eq!(map.slot_base(SlotId::Write(0)).unwrap(), 1000);
        assert_eq!(map.slot_base(SlotId::Write(29)).unwrap(), 2450);
        assert_eq!(map.slot_base(SlotId::Read(9)).unwrap(), 3450);
        assert!(map.slot_base(SlotId::Write(30)).is_err());
        assert!(map.slot_base(SlotId::Read(10)).is_err());
        assert_eq!(map.slot_range(SlotId::Failure).unwrap(), 3600..3623);
    }

    #[test]
    fn test_field_addresses() {
        let map = MemoryMap::standard();
        assert_eq!(map.address_of(SlotId::Write(1), FieldKey::BatchNumber).unwrap(), 1065);
        assert_eq!(map.address_of(SlotId::Write(0), FieldKey::LiquidPlanned(2)).unwrap(), 1046);
        assert_eq!(map.address_of(SlotId::Read(0), FieldKey::Progress).unwrap(), 3045);
        assert_eq!(map.address_of(SlotId::Read(2), FieldKey::StageCode).unwrap(), 3146);
        assert!(map.address_of(SlotId::Read(0), FieldKey::TargetWeight).is_err());
    }

    #[test]
    fn test_flag_addresses() {
        let map = MemoryMap::standard();
        assert_eq!(map.flag_address(SlotId::Write(17)).unwrap(), 4000);
        assert_eq!(map.flag_address(SlotId::Read(0)).unwrap(), 4001);
        assert_eq!(map.flag_address(SlotId::Read(9)).unwrap(), 4010);
        assert_eq!(map.flag_address(SlotId::Failure).unwrap(), 4011);
    }

    #[test]
    fn test_overlapping_regions_fail_validation() {
        let mut map = MemoryMap::standard();
        map.read_base = 2400;
        let err = map.validate().unwrap_err().to_string();
        assert!(err.contains("overlaps"), "{err}");
    }

    #[test]
    fn test_flag_inside_slot_fails_validation() {
        let mut map = MemoryMap::standard();
        map.failure_flag = 3610;
        assert!(map.validate().is_err());
    }

    #[test]
    fn test_bad_field_width_fails_validation() {
        let mut map = MemoryMap::standard();
        map.read_template.fields[3].words = 2;
        assert!(map.validate().is_err());
    }

    #[test]
    fn test_field_key_names() {
        assert_eq!(FieldKey::WorkOrder.to_string(), "work_order");
        assert_eq!(FieldKey::SolidPlanned(3).to_string(), "solid_03_planned");
        assert_eq!(FieldKey::LiquidActual(2).to_string(), "liquid_02_actual");
    }
}
