//! Reward redemption: debit plus audit record as one transaction.
//!
//! # Responsibility
//! - Check that the balance covers a reward's cost.
//! - Debit the balance and append a `RewardHistory` snapshot atomically.
//!
//! # Invariants
//! - The debit is conditioned on the balance read earlier in the same call;
//!   a concurrent change fails the whole transaction instead of clobbering it.
//! - No mutation happens on validation, lookup or sufficiency failures.
//! - History rows are written only here and never modified afterwards.

use crate::context::OpContext;
use crate::error::{BusinessRule, Entity, PointsError, PointsResult};
use crate::ledger::Ledger;
use crate::model::balance::{CurrentPoints, RewardHistory};
use crate::model::item::{Reward, RewardId};
use crate::model::now_epoch_ms;
use crate::service::{collect_records, map_lookup_error, unexpected_record};
use crate::store::{Record, Store, StoreError, Table, WriteOp};
use log::{info, warn};

/// Outcome of a successful redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    pub history: RewardHistory,
    pub balance: CurrentPoints,
}

/// Redemption coordinator.
pub struct RedemptionCoordinator<S: Store> {
    store: S,
    ledger: Ledger<S>,
}

impl<S: Store + Clone> RedemptionCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            store,
        }
    }
}

impl<S: Store> RedemptionCoordinator<S> {
    /// Redeems one reward against the current balance.
    ///
    /// # Errors
    /// - `NotFound` when the reward does not exist.
    /// - `BusinessLogic(InsufficientPoints)` when the balance is below cost.
    /// - `BusinessLogic(ConcurrentModification)` when the balance changed
    ///   after it was read; nothing is written.
    /// - `Database` for store failures; the transaction is rolled back.
    pub fn redeem(&self, ctx: &OpContext, reward_id: RewardId) -> PointsResult<Redemption> {
        let reward = self.load_reward(ctx, reward_id)?;
        let balance = self.ledger.get_balance(ctx)?;

        if balance.point < reward.point {
            info!(
                "event=redeem module=redemption status=insufficient reward_id={} required={} available={}",
                reward.id, reward.point, balance.point
            );
            return Err(PointsError::insufficient_points(
                "redeem",
                reward.point,
                balance.point,
            ));
        }

        let now = now_epoch_ms();
        let debit = self.ledger.stage_debit(&balance, reward.point, now)?;
        let history = RewardHistory::snapshot(&reward, now);
        let ops = [
            debit.op,
            WriteOp::insert(Record::RewardHistory(history.clone())),
        ];

        match self.store.transact_write(ctx, &ops) {
            Ok(()) => {
                info!(
                    "event=redeem module=redemption status=ok reward_id={} history_id={} cost={} balance={}",
                    reward.id, history.id, reward.point, debit.balance.point
                );
                Ok(Redemption {
                    history,
                    balance: debit.balance,
                })
            }
            Err(StoreError::ConditionFailed {
                table: Table::CurrentPoints,
                ..
            }) => {
                warn!(
                    "event=redeem module=redemption status=conflict reward_id={} read_balance={}",
                    reward.id, balance.point
                );
                Err(PointsError::BusinessLogic {
                    operation: "redeem",
                    reason: BusinessRule::ConcurrentModification,
                })
            }
            Err(err) => {
                warn!(
                    "event=redeem module=redemption status=error reward_id={} error={}",
                    reward.id, err
                );
                Err(PointsError::database("redeem", Table::RewardHistory, err))
            }
        }
    }

    /// Lists redemption history, newest first.
    pub fn history(&self, ctx: &OpContext) -> PointsResult<Vec<RewardHistory>> {
        let page = self
            .store
            .scan(ctx, Table::RewardHistory)
            .map_err(|err| PointsError::database("list_history", Table::RewardHistory, err))?;
        let mut entries = collect_records(page, "list_history", Table::RewardHistory, |record| {
            match record {
                Record::RewardHistory(entry) => Some(entry),
                _ => None,
            }
        })?;
        entries.sort_by(|a, b| {
            b.redeemed_at
                .cmp(&a.redeemed_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(entries)
    }

    fn load_reward(&self, ctx: &OpContext, reward_id: RewardId) -> PointsResult<Reward> {
        let record = self
            .store
            .get(ctx, Table::Rewards, &reward_id.to_string())
            .map_err(|err| map_lookup_error(err, "redeem", Entity::Reward, reward_id))?;
        match record {
            Record::Reward(reward) => Ok(reward),
            other => Err(unexpected_record("redeem", other)),
        }
    }
}
