//! Drift reporting between accrued achievement points and the balance.
//!
//! # Invariants
//! - Read-only: never corrects the balance or any achievement.
//! - Malformed achievement rows are skipped and logged, not fatal.

use crate::context::OpContext;
use crate::error::{PointsError, PointsResult};
use crate::ledger::Ledger;
use crate::model::balance::{AggregatePoints, CurrentPoints};
use crate::store::{Record, Store, Table};
use log::{info, warn};

/// Read-side reporter for balance and drift.
pub struct ReconciliationReporter<S: Store> {
    store: S,
    ledger: Ledger<S>,
}

impl<S: Store + Clone> ReconciliationReporter<S> {
    pub fn new(store: S) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            store,
        }
    }
}

impl<S: Store> ReconciliationReporter<S> {
    pub fn current_points(&self, ctx: &OpContext) -> PointsResult<CurrentPoints> {
        self.ledger.get_balance(ctx)
    }

    /// Sums achievement points and compares them with the balance.
    ///
    /// Both are read from one store snapshot, so a committed write lands in
    /// both sides or neither. An accrual still between its two steps shows up
    /// as transient drift. A positive `difference` is normal after
    /// redemptions; other values point at accrual or compensation drift.
    pub fn aggregate_points(&self, ctx: &OpContext) -> PointsResult<AggregatePoints> {
        let (page, balance) = self
            .store
            .scan_with_balance(ctx, Table::Achievements)
            .map_err(|err| PointsError::database("aggregate_points", Table::Achievements, err))?;
        let balance = balance.unwrap_or_else(CurrentPoints::zero);

        for row in &page.malformed {
            warn!(
                "event=reconciliation module=reconciliation status=skipped key={} reason={}",
                row.key, row.reason
            );
        }

        let mut total_achievements = 0_u64;
        let mut total_points = 0_i64;
        for record in page.records {
            match record {
                Record::Achievement(achievement) if achievement.point > 0 => {
                    total_achievements += 1;
                    total_points = total_points.saturating_add(achievement.point);
                }
                other => warn!(
                    "event=reconciliation module=reconciliation status=skipped key={} reason=unexpected_record",
                    other.key()
                ),
            }
        }

        let report = AggregatePoints::new(total_achievements, total_points, balance.point);
        info!(
            "event=reconciliation module=reconciliation status=ok total_achievements={} total_points={} balance={} difference={}",
            report.total_achievements, report.total_points, report.current_balance, report.difference
        );
        Ok(report)
    }
}
