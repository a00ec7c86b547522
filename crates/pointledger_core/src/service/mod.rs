//! Coordinators consumed by presentation layers.
//!
//! # Responsibility
//! - Orchestrate ledger and store calls into use-case level APIs.
//! - Translate store failures into the structured `PointsError` taxonomy.
//!
//! # Invariants
//! - Coordinators are stateless; all mutable state lives in the store.
//! - Accrual and redemption never call each other.

pub mod accrual;
pub mod reconciliation;
pub mod redemption;
pub mod reward;

use crate::error::{Entity, PointsError, PointsResult};
use crate::store::{Record, ScanPage, StoreError, Table};
use uuid::Uuid;

fn entity_table(entity: Entity) -> Table {
    match entity {
        Entity::Achievement => Table::Achievements,
        Entity::Reward => Table::Rewards,
    }
}

/// Maps a keyed store failure, treating absence as `NotFound`.
///
/// `ConditionFailed` counts as absence because keyed writes here are only
/// conditioned on `Condition::Exists`.
pub(crate) fn map_lookup_error(
    err: StoreError,
    operation: &'static str,
    entity: Entity,
    id: Uuid,
) -> PointsError {
    match err {
        StoreError::NotFound { .. } | StoreError::ConditionFailed { .. } => PointsError::NotFound {
            entity,
            id: id.to_string(),
        },
        other => PointsError::database(operation, entity_table(entity), other),
    }
}

pub(crate) fn unexpected_record(operation: &'static str, record: Record) -> PointsError {
    let table = record.table();
    PointsError::database(
        operation,
        table,
        StoreError::InvalidData(format!("unexpected {table} record")),
    )
}

/// Converts a scan into typed records, rejecting any invalid persisted row.
pub(crate) fn collect_records<T>(
    page: ScanPage,
    operation: &'static str,
    table: Table,
    mut extract: impl FnMut(Record) -> Option<T>,
) -> PointsResult<Vec<T>> {
    if let Some(row) = page.malformed.first() {
        return Err(PointsError::database(
            operation,
            table,
            StoreError::InvalidData(format!("row {}: {}", row.key, row.reason)),
        ));
    }

    let mut items = Vec::with_capacity(page.records.len());
    for record in page.records {
        let record_table = record.table();
        match extract(record) {
            Some(item) => items.push(item),
            None => {
                return Err(PointsError::database(
                    operation,
                    table,
                    StoreError::InvalidData(format!("unexpected {record_table} record")),
                ))
            }
        }
    }
    Ok(items)
}
