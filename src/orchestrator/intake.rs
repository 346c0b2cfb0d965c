//! Intake: pending ERP orders become batches in the PLC write slots.
//!
//! Orders that cannot be represented in a slot are rejected one by one so
//! they never hold back the rest of the page. The accepted batches are staged
//! in one store transaction, written slot by slot, committed, and only then
//! is the write turn handed back to the PLC.

use serde::Serialize;

use super::{Orchestrator, SyncError};
use crate::batch::{ComponentKind, ComponentLine, NewBatch};
use crate::erp::PendingOrder;
use crate::handshake::HandshakeError;
use crate::memory_map::SlotTemplate;
use crate::registers::SlotOrder;
use crate::store::StoreError;

/// Outcome of an intake run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntakeReport {
    /// Why nothing was staged, when nothing was.
    pub skipped_reason: Option<String>,
    /// Orders returned by the ERP.
    pub fetched: usize,
    /// Orders that could not be mapped to a batch.
    pub rejected_orders: Vec<String>,
    /// Batches staged in the transaction.
    pub staged: usize,
    /// Slots fully written.
    pub written: usize,
    /// Work orders committed to the active table.
    pub committed: Vec<String>,
}

impl IntakeReport {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Maps an ERP order to batch number `batch_number`.
///
/// Components whose equipment starts with `liquid_prefix` are liquid, all
/// others solid. The resulting slot payload is encoded against `template`
/// up front.
///
/// # Errors
///
/// Describes the problem when the order has more solid or liquid
/// components than a slot holds, or a field does not fit its slot field
/// (work order too long or not ASCII, quantity out of range).
pub fn batch_from_order(
    order: &PendingOrder,
    batch_number: u16,
    liquid_prefix: &str,
    template: &SlotTemplate,
) -> Result<NewBatch, String> {
    let mut components = Vec::with_capacity(order.components.len());
    let mut next = [0u8; 2];

    for component in &order.components {
        let is_liquid = component
            .equipment
            .as_deref()
            .is_some_and(|e| !liquid_prefix.is_empty() && e.starts_with(liquid_prefix));
        let (kind, counter) = if is_liquid {
            (ComponentKind::Liquid, &mut next[1])
        } else {
            (ComponentKind::Solid, &mut next[0])
        };
        *counter += 1;
        if *counter > kind.capacity() {
            return Err(format!(
                "{}: more than {} {kind:?} components",
                order.work_order,
                kind.capacity()
            ));
        }
        components.push(ComponentLine {
            kind,
            index: *counter,
            code: component.product_code.clone(),
            name: component.name.clone(),
            planned: component.quantity,
            actual: None,
        });
    }

    let batch = NewBatch {
        batch_number,
        work_order: order.work_order.clone(),
        equipment: order.equipment.clone(),
        target_weight: order.quantity,
        components,
    };
    SlotOrder::from_batch(&batch)
        .check_encodable(template)
        .map_err(|e| format!("{}: {e}", order.work_order))?;
    Ok(batch)
}

impl Orchestrator {
    pub(super) async fn intake(&self) -> Result<IntakeReport, SyncError> {
        if self.store.count_active().await? > 0 {
            tracing::debug!("intake skipped: active batches present");
            return Ok(IntakeReport::skipped("active batches present"));
        }

        let limit = self
            .settings
            .page_size
            .min(u32::from(self.registers.map().write_slots));
        let orders = self.erp.list_pending_orders(limit, 0).await?;
        if orders.is_empty() {
            return Ok(IntakeReport::skipped("no pending work orders"));
        }

        let mut report = IntakeReport {
            fetched: orders.len(),
            ..Default::default()
        };
        let mut batches = Vec::with_capacity(orders.len());
        for order in orders.iter().take(limit as usize) {
            let number = batches.len() as u16 + 1;
            let template = &self.registers.map().write_template;
            match batch_from_order(order, number, &self.settings.liquid_prefix, template) {
                Ok(batch) => batches.push(batch),
                Err(reason) => {
                    tracing::warn!(work_order = %order.work_order, %reason, "order skipped");
                    report.rejected_orders.push(order.work_order.clone());
                }
            }
        }
        if batches.is_empty() {
            report.skipped_reason = Some("no order fits a slot".into());
            return Ok(report);
        }

        let turn = match self.handshake.acquire_write().await {
            Ok(turn) => turn,
            Err(HandshakeError::NotReady { value, .. }) => {
                report.skipped_reason = Some(format!("PLC not ready (write flag {value})"));
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        // From here until commit the intake transaction holds a store
        // connection; only the PLC is touched.
        let mut intake = self.store.begin_intake().await?;
        for batch in &batches {
            if let Err(e) = intake.stage(batch).await {
                intake.rollback().await?;
                return Err(e.into());
            }
        }
        report.staged = intake.staged().len();

        for (index, batch) in batches.iter().enumerate() {
            let order = SlotOrder::from_batch(batch);
            let result = self
                .registers
                .write_slot(index as u8, &order)
                .await
                .and_then(|write| write.into_result());
            match result {
                Ok(_) => report.written += 1,
                Err(e) => {
                    tracing::error!(slot = index, work_order = %batch.work_order, error = %e, "slot write failed, aborting intake");
                    break;
                }
            }
        }

        if report.written != report.staged {
            // The write flag stays set, so the PLC never starts on the partial slots.
            intake.rollback().await?;
            return Err(StoreError::IntakeMismatch {
                staged: report.staged,
                written: report.written,
            }
            .into());
        }

        // A failed commit leaves the write flag set: the PLC never starts and
        // the next intake overwrites the slots.
        let records = intake.commit(report.written).await?;
        report.committed = records.into_iter().map(|r| r.work_order).collect();

        if let Err(e) = self.handshake.release_write(turn).await {
            tracing::error!(error = %e, "write flag not released, archiving the committed batches");
            self.store
                .clear_active("write turn not handed back to the PLC")
                .await?;
            return Err(e.into());
        }

        tracing::info!(
            committed = report.committed.len(),
            rejected = report.rejected_orders.len(),
            "intake committed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erp::OrderComponent;
    use crate::memory_map::MemoryMap;

    fn component(code: &str, equipment: Option<&str>) -> OrderComponent {
        OrderComponent {
            product_code: code.into(),
            name: None,
            quantity: 10.0,
            equipment: equipment.map(str::to_string),
        }
    }

    fn map(order: &PendingOrder) -> Result<NewBatch, String> {
        batch_from_order(order, 1, "LIQ", &MemoryMap::standard().write_template)
    }

    fn order(components: Vec<OrderComponent>) -> PendingOrder {
        PendingOrder {
            work_order: "WO-1".into(),
            equipment: "MIX01".into(),
            quantity: 40.0,
            components,
        }
    }

    #[test]
    fn test_components_split_by_prefix() {
        let batch = batch_from_order(
            &order(vec![
                component("FLOUR", Some("SILO1")),
                component("WATER", Some("LIQ-A")),
                component("SALT", None),
            ]),
            3,
            "LIQ",
            &MemoryMap::standard().write_template,
        )
        .unwrap();

        assert_eq!(batch.batch_number, 3);
        let kinds: Vec<_> = batch.components.iter().map(|c| (c.kind, c.index)).collect();
        assert_eq!(
            kinds,
            vec![
                (ComponentKind::Solid, 1),
                (ComponentKind::Liquid, 1),
                (ComponentKind::Solid, 2)
            ]
        );
    }

    #[test]
    fn test_too_many_liquids_rejected() {
        let components = (0..3).map(|i| component(&format!("L{i}"), Some("LIQ"))).collect();
        let err = map(&order(components)).unwrap_err();
        assert!(err.contains("Liquid"), "{err}");
    }

    #[test]
    fn test_thirteen_solids_fit() {
        let components = (0..13).map(|i| component(&format!("S{i}"), None)).collect();
        assert!(map(&order(components)).is_ok());
        let components = (0..14).map(|i| component(&format!("S{i}"), None)).collect();
        assert!(map(&order(components)).is_err());
    }

    #[test]
    fn test_work_order_longer_than_slot_field_rejected() {
        let mut long = order(vec![component("FLOUR", None)]);
        long.work_order = "WH/MO/2026/10/000123-A".into();
        let err = map(&long).unwrap_err();
        assert!(err.contains("22 characters"), "{err}");

        long.work_order = "WH/MO/2026/10/000123".into();
        assert!(map(&long).is_ok());
    }

    #[test]
    fn test_unencodable_values_rejected() {
        let mut accented = order(vec![component("FLOUR", None)]);
        accented.work_order = "WO-Ä1".into();
        assert!(map(&accented).unwrap_err().contains("WO-Ä1"));

        let mut huge = order(vec![component("FLOUR", None)]);
        huge.quantity = 5e7;
        assert!(map(&huge).unwrap_err().contains("target_weight"));

        let mut huge_component = order(vec![component("FLOUR", None)]);
        huge_component.components[0].quantity = 5e7;
        assert!(map(&huge_component).is_err());
    }
}
