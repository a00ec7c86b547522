//! Achievement use-cases and the accrual saga.
//!
//! # Responsibility
//! - Create/update/get/list/delete achievements.
//! - Accrue an achievement's points exactly once, at creation.
//!
//! # Invariants
//! - Update and delete never touch the ledger.
//! - Create is a two-step saga over independently committed records:
//!   1. persist the achievement;
//!   2. increment the balance.
//!
//!   If step 2 fails, step 1 is compensated by deleting the achievement.
//!   If the compensation fails too, the saga ends in the `Composite` state:
//!   the achievement exists without its points and the error says so.

use crate::config::LedgerConfig;
use crate::context::OpContext;
use crate::error::{Entity, PointsError, PointsResult};
use crate::ledger::Ledger;
use crate::model::item::{Achievement, AchievementId, ItemDraft};
use crate::model::now_epoch_ms;
use crate::service::{collect_records, map_lookup_error, unexpected_record};
use crate::store::{Condition, Record, Store, StoreError, Table, WriteOp};
use log::{error, info, warn};
use std::time::Duration;

/// Achievement coordinator.
pub struct AccrualCoordinator<S: Store> {
    store: S,
    ledger: Ledger<S>,
    compensation_timeout: Duration,
}

impl<S: Store + Clone> AccrualCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, &LedgerConfig::default())
    }

    pub fn with_config(store: S, config: &LedgerConfig) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            store,
            compensation_timeout: config.compensation_timeout(),
        }
    }
}

impl<S: Store> AccrualCoordinator<S> {
    /// Creates an achievement and accrues its points.
    ///
    /// # Errors
    /// - `Validation` for an empty title or non-positive point; nothing written.
    /// - `Database` when the achievement cannot be persisted; nothing written.
    /// - The original accrual error when the increment fails and the
    ///   achievement was removed again.
    /// - `Composite` when the increment and the compensating delete both fail.
    pub fn create(&self, ctx: &OpContext, draft: ItemDraft) -> PointsResult<Achievement> {
        draft.validate()?;
        let achievement = Achievement::create(draft, now_epoch_ms());

        self.store
            .put(ctx, &Record::Achievement(achievement.clone()))
            .map_err(|err| {
                error!(
                    "event=accrual_saga module=accrual step=persist status=error achievement_id={} error={}",
                    achievement.id, err
                );
                PointsError::database("create_achievement", Table::Achievements, err)
            })?;

        match self.ledger.increment(ctx, achievement.point) {
            Ok(balance) => {
                info!(
                    "event=accrual_saga module=accrual step=accrue status=ok achievement_id={} point={} balance={}",
                    achievement.id, achievement.point, balance.point
                );
                Ok(achievement)
            }
            Err(accrual_error) => Err(self.compensate(ctx, &achievement, accrual_error)),
        }
    }

    /// Undoes step 1 after step 2 failed and returns the error to surface.
    fn compensate(
        &self,
        ctx: &OpContext,
        achievement: &Achievement,
        accrual_error: PointsError,
    ) -> PointsError {
        warn!(
            "event=accrual_saga module=accrual step=accrue status=error achievement_id={} error={}",
            achievement.id, accrual_error
        );

        // Runs detached so a cancelled request still undoes its own write.
        let compensation_ctx = ctx.detached(self.compensation_timeout);
        let key = achievement.id.to_string();
        match self
            .store
            .delete(&compensation_ctx, Table::Achievements, &key)
        {
            Ok(()) | Err(StoreError::NotFound { .. }) => {
                warn!(
                    "event=accrual_saga module=accrual step=compensate status=ok achievement_id={}",
                    achievement.id
                );
                accrual_error
            }
            Err(err) => {
                error!(
                    "event=accrual_saga module=accrual step=compensate status=composite achievement_id={} point={} error={}",
                    achievement.id, achievement.point, err
                );
                PointsError::Composite {
                    achievement_id: achievement.id,
                    accrual_error: Box::new(accrual_error),
                    compensation_error: Box::new(PointsError::database(
                        "compensate_achievement",
                        Table::Achievements,
                        err,
                    )),
                }
            }
        }
    }

    /// Replaces title/description/point; `id` and `created_at` are preserved.
    ///
    /// The ledger is not adjusted for a changed point value.
    pub fn update(
        &self,
        ctx: &OpContext,
        id: AchievementId,
        draft: ItemDraft,
    ) -> PointsResult<Achievement> {
        draft.validate()?;
        let mut achievement = self.get(ctx, id)?;
        achievement.replace(draft);

        let op = WriteOp::put_if(Record::Achievement(achievement.clone()), Condition::Exists);
        self.store
            .transact_write(ctx, &[op])
            .map_err(|err| map_lookup_error(err, "update_achievement", Entity::Achievement, id))?;
        info!(
            "event=achievement_update module=accrual status=ok achievement_id={}",
            id
        );
        Ok(achievement)
    }

    pub fn get(&self, ctx: &OpContext, id: AchievementId) -> PointsResult<Achievement> {
        let record = self
            .store
            .get(ctx, Table::Achievements, &id.to_string())
            .map_err(|err| map_lookup_error(err, "get_achievement", Entity::Achievement, id))?;
        match record {
            Record::Achievement(achievement) => Ok(achievement),
            other => Err(unexpected_record("get_achievement", other)),
        }
    }

    /// Lists achievements, newest first.
    pub fn list(&self, ctx: &OpContext) -> PointsResult<Vec<Achievement>> {
        let page = self
            .store
            .scan(ctx, Table::Achievements)
            .map_err(|err| PointsError::database("list_achievements", Table::Achievements, err))?;
        let mut achievements =
            collect_records(page, "list_achievements", Table::Achievements, |record| {
                match record {
                    Record::Achievement(achievement) => Some(achievement),
                    _ => None,
                }
            })?;
        achievements.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(achievements)
    }

    /// Deletes an achievement. Points already accrued stay on the balance.
    pub fn delete(&self, ctx: &OpContext, id: AchievementId) -> PointsResult<()> {
        self.store
            .delete(ctx, Table::Achievements, &id.to_string())
            .map_err(|err| map_lookup_error(err, "delete_achievement", Entity::Achievement, id))?;
        info!(
            "event=achievement_delete module=accrual status=ok achievement_id={} ledger=unchanged",
            id
        );
        Ok(())
    }
}
