//! Reward catalog use-cases.
//!
//! # Invariants
//! - Reward writes never touch the ledger or redemption history.
//! - Deleting a reward leaves its history snapshots intact.

use crate::context::OpContext;
use crate::error::{Entity, PointsError, PointsResult};
use crate::model::item::{ItemDraft, Reward, RewardId};
use crate::model::now_epoch_ms;
use crate::service::{collect_records, map_lookup_error, unexpected_record};
use crate::store::{Condition, Record, Store, Table, WriteOp};
use log::info;

/// Reward catalog service.
pub struct RewardService<S: Store> {
    store: S,
}

impl<S: Store> RewardService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Creates a reward; `point` is its redemption cost.
    pub fn create(&self, ctx: &OpContext, draft: ItemDraft) -> PointsResult<Reward> {
        draft.validate()?;
        let reward = Reward::create(draft, now_epoch_ms());
        self.store
            .transact_write(ctx, &[WriteOp::insert(Record::Reward(reward.clone()))])
            .map_err(|err| PointsError::database("create_reward", Table::Rewards, err))?;
        info!(
            "event=reward_create module=reward status=ok reward_id={} cost={}",
            reward.id, reward.point
        );
        Ok(reward)
    }

    /// Full-record replace. Past redemptions keep their snapshot cost.
    pub fn update(&self, ctx: &OpContext, id: RewardId, draft: ItemDraft) -> PointsResult<Reward> {
        draft.validate()?;
        let mut reward = self.get(ctx, id)?;
        reward.replace(draft);

        let op = WriteOp::put_if(Record::Reward(reward.clone()), Condition::Exists);
        self.store
            .transact_write(ctx, &[op])
            .map_err(|err| map_lookup_error(err, "update_reward", Entity::Reward, id))?;
        Ok(reward)
    }

    pub fn get(&self, ctx: &OpContext, id: RewardId) -> PointsResult<Reward> {
        let record = self
            .store
            .get(ctx, Table::Rewards, &id.to_string())
            .map_err(|err| map_lookup_error(err, "get_reward", Entity::Reward, id))?;
        match record {
            Record::Reward(reward) => Ok(reward),
            other => Err(unexpected_record("get_reward", other)),
        }
    }

    /// Lists rewards, newest first.
    pub fn list(&self, ctx: &OpContext) -> PointsResult<Vec<Reward>> {
        let page = self
            .store
            .scan(ctx, Table::Rewards)
            .map_err(|err| PointsError::database("list_rewards", Table::Rewards, err))?;
        let mut rewards = collect_records(page, "list_rewards", Table::Rewards, |record| {
            match record {
                Record::Reward(reward) => Some(reward),
                _ => None,
            }
        })?;
        rewards.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(rewards)
    }

    pub fn delete(&self, ctx: &OpContext, id: RewardId) -> PointsResult<()> {
        self.store
            .delete(ctx, Table::Rewards, &id.to_string())
            .map_err(|err| map_lookup_error(err, "delete_reward", Entity::Reward, id))?;
        info!("event=reward_delete module=reward status=ok reward_id={}", id);
        Ok(())
    }
}
