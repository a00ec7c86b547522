use pointledger_core::db::{open_db, open_db_in_memory};
use pointledger_core::{
    AccrualCoordinator, CurrentPoints, Entity, ItemDraft, Ledger, OpContext, PointsError, Record,
    RedemptionCoordinator, Reward, RewardService, ScanPage, SqliteStore, Store, StoreResult, Table,
    WriteOp,
};
use std::cell::Cell;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

fn seed_balance(store: SqliteStore<'_>, point: i64) {
    AccrualCoordinator::new(store)
        .create(
            &OpContext::background(),
            ItemDraft::new("seed", "opening balance", point),
        )
        .unwrap();
}

fn seed_reward(store: SqliteStore<'_>, title: &str, cost: i64) -> Reward {
    RewardService::new(store)
        .create(&OpContext::background(), ItemDraft::new(title, "", cost))
        .unwrap()
}

fn balance_of(store: impl Store) -> i64 {
    Ledger::new(store)
        .get_balance(&OpContext::background())
        .unwrap()
        .point
}

#[test]
fn redeem_debits_balance_and_records_snapshot() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    seed_balance(store, 100);
    let reward = seed_reward(store, "Coffee", 30);
    let redemption = RedemptionCoordinator::new(store);
    let ctx = OpContext::background();

    let outcome = redemption.redeem(&ctx, reward.id).unwrap();
    assert_eq!(outcome.balance.point, 70);
    assert_eq!(outcome.history.reward_id, reward.id);
    assert_eq!(outcome.history.reward_title, "Coffee");
    assert_eq!(outcome.history.point_cost, 30);
    assert_eq!(outcome.history.redeemed_at, outcome.balance.updated_at);

    assert_eq!(balance_of(store), 70);
    assert_eq!(redemption.history(&ctx).unwrap(), vec![outcome.history]);
}

#[test]
fn insufficient_balance_rejects_without_mutation() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    seed_balance(store, 100);
    let reward = seed_reward(store, "Headphones", 150);
    let redemption = RedemptionCoordinator::new(store);
    let ctx = OpContext::background();

    let err = redemption.redeem(&ctx, reward.id).unwrap_err();
    assert!(err.is_insufficient_points());
    let message = err.to_string();
    assert!(message.contains("150") && message.contains("100"), "{message}");

    assert_eq!(balance_of(store), 100);
    assert!(redemption.history(&ctx).unwrap().is_empty());
}

#[test]
fn redeeming_unknown_reward_is_not_found() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    seed_balance(store, 100);
    let redemption = RedemptionCoordinator::new(store);

    let err = redemption
        .redeem(&OpContext::background(), Uuid::now_v7())
        .unwrap_err();
    assert!(matches!(
        err,
        PointsError::NotFound {
            entity: Entity::Reward,
            ..
        }
    ));
    assert_eq!(balance_of(store), 100);
}

#[test]
fn failed_history_insert_rolls_back_the_debit() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    seed_balance(store, 100);
    let reward = seed_reward(store, "Cinema", 40);
    conn.execute_batch(
        "CREATE TRIGGER fail_history_insert BEFORE INSERT ON reward_history
         BEGIN SELECT RAISE(ABORT, 'history insert rejected'); END;",
    )
    .unwrap();
    let redemption = RedemptionCoordinator::new(store);
    let ctx = OpContext::background();

    let err = redemption.redeem(&ctx, reward.id).unwrap_err();
    assert!(matches!(
        err,
        PointsError::Database {
            operation: "redeem",
            ..
        }
    ));
    assert_eq!(balance_of(store), 100);
    assert!(redemption.history(&ctx).unwrap().is_empty());
}

/// Bumps the balance between the coordinator's read and its transaction.
struct InterleavingStore<'conn> {
    inner: SqliteStore<'conn>,
    armed: Cell<bool>,
}

impl Store for InterleavingStore<'_> {
    fn get(&self, ctx: &OpContext, table: Table, key: &str) -> StoreResult<Record> {
        self.inner.get(ctx, table, key)
    }

    fn put(&self, ctx: &OpContext, record: &Record) -> StoreResult<()> {
        self.inner.put(ctx, record)
    }

    fn scan(&self, ctx: &OpContext, table: Table) -> StoreResult<ScanPage> {
        self.inner.scan(ctx, table)
    }

    fn scan_with_balance(
        &self,
        ctx: &OpContext,
        table: Table,
    ) -> StoreResult<(ScanPage, Option<CurrentPoints>)> {
        self.inner.scan_with_balance(ctx, table)
    }

    fn delete(&self, ctx: &OpContext, table: Table, key: &str) -> StoreResult<()> {
        self.inner.delete(ctx, table, key)
    }

    fn transact_write(&self, ctx: &OpContext, ops: &[WriteOp]) -> StoreResult<()> {
        if self.armed.replace(false) {
            self.inner.increment_counter(ctx, 5)?;
        }
        self.inner.transact_write(ctx, ops)
    }

    fn increment_counter(&self, ctx: &OpContext, delta: i64) -> StoreResult<CurrentPoints> {
        self.inner.increment_counter(ctx, delta)
    }

    fn decrement_counter_if_sufficient(
        &self,
        ctx: &OpContext,
        delta: i64,
    ) -> StoreResult<Option<CurrentPoints>> {
        self.inner.decrement_counter_if_sufficient(ctx, delta)
    }
}

#[test]
fn balance_change_after_read_is_a_concurrent_modification() {
    let conn = open_db_in_memory().unwrap();
    let inner = SqliteStore::try_new(&conn).unwrap();
    seed_balance(inner, 100);
    let reward = seed_reward(inner, "Snack", 60);

    let store = InterleavingStore {
        inner,
        armed: Cell::new(true),
    };
    let redemption = RedemptionCoordinator::new(&store);
    let ctx = OpContext::background();

    let err = redemption.redeem(&ctx, reward.id).unwrap_err();
    assert!(err.is_concurrent_modification());
    assert!(err.is_retryable());
    assert_eq!(balance_of(inner), 105);
    assert!(redemption.history(&ctx).unwrap().is_empty());

    let retried = redemption.redeem(&ctx, reward.id).unwrap();
    assert_eq!(retried.balance.point, 45);
}

#[test]
fn racing_redemptions_never_overspend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race.db");
    let rewards = {
        let conn = open_db(&path).unwrap();
        let store = SqliteStore::try_new(&conn).unwrap();
        seed_balance(store, 100);
        [seed_reward(store, "A", 60), seed_reward(store, "B", 60)]
    };

    let barrier = Arc::new(Barrier::new(rewards.len()));
    let handles: Vec<_> = rewards
        .iter()
        .map(|reward| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            let reward_id = reward.id;
            thread::spawn(move || {
                let conn = open_db(&path).unwrap();
                let redemption = RedemptionCoordinator::new(SqliteStore::try_new(&conn).unwrap());
                barrier.wait();
                redemption.redeem(&OpContext::background(), reward_id)
            })
        })
        .collect();
    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    for err in results.iter().filter_map(|result| result.as_ref().err()) {
        assert!(
            err.is_insufficient_points() || err.is_concurrent_modification(),
            "unexpected error: {err}"
        );
    }

    let conn = open_db(&path).unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    assert_eq!(balance_of(store), 40);
    let history = RedemptionCoordinator::new(store)
        .history(&OpContext::background())
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].point_cost, 60);
}

#[test]
fn history_snapshot_survives_reward_edits_and_deletion() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    seed_balance(store, 100);
    let reward = seed_reward(store, "Book", 25);
    let rewards = RewardService::new(store);
    let redemption = RedemptionCoordinator::new(store);
    let ctx = OpContext::background();

    let outcome = redemption.redeem(&ctx, reward.id).unwrap();
    rewards
        .update(&ctx, reward.id, ItemDraft::new("Hardcover book", "", 80))
        .unwrap();
    rewards.delete(&ctx, reward.id).unwrap();

    let history = redemption.history(&ctx).unwrap();
    assert_eq!(history, vec![outcome.history]);
    assert_eq!(history[0].reward_title, "Book");
    assert_eq!(history[0].point_cost, 25);
    assert_eq!(balance_of(store), 75);
}

#[test]
fn history_lists_newest_first() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    seed_balance(store, 100);
    let tea = seed_reward(store, "Tea", 10);
    let cake = seed_reward(store, "Cake", 20);
    let redemption = RedemptionCoordinator::new(store);
    let ctx = OpContext::background();

    let first = redemption.redeem(&ctx, tea.id).unwrap();
    thread::sleep(Duration::from_millis(2));
    let second = redemption.redeem(&ctx, cake.id).unwrap();

    let ids: Vec<_> = redemption
        .history(&ctx)
        .unwrap()
        .into_iter()
        .map(|entry| entry.id)
        .collect();
    assert_eq!(ids, vec![second.history.id, first.history.id]);
    assert_eq!(balance_of(store), 70);
}

#[test]
fn reward_catalog_crud() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let rewards = RewardService::new(store);
    let ctx = OpContext::background();

    assert!(matches!(
        rewards.create(&ctx, ItemDraft::new("free", "", 0)),
        Err(PointsError::Validation(_))
    ));

    let massage = rewards
        .create(&ctx, ItemDraft::new("Massage", "spa", 200))
        .unwrap();
    thread::sleep(Duration::from_millis(2));
    let game = rewards.create(&ctx, ItemDraft::new("Game", "", 120)).unwrap();
    assert_eq!(rewards.get(&ctx, massage.id).unwrap(), massage);

    let listed: Vec<_> = rewards
        .list(&ctx)
        .unwrap()
        .into_iter()
        .map(|reward| reward.id)
        .collect();
    assert_eq!(listed, vec![game.id, massage.id]);

    let updated = rewards
        .update(&ctx, massage.id, ItemDraft::new("Long massage", "spa", 250))
        .unwrap();
    assert_eq!(updated.id, massage.id);
    assert_eq!(updated.created_at, massage.created_at);
    assert_eq!(rewards.get(&ctx, massage.id).unwrap().point, 250);

    rewards.delete(&ctx, massage.id).unwrap();
    assert!(matches!(
        rewards.get(&ctx, massage.id),
        Err(PointsError::NotFound {
            entity: Entity::Reward,
            ..
        })
    ));
    assert!(matches!(
        rewards.update(&ctx, massage.id, ItemDraft::new("x", "", 1)),
        Err(PointsError::NotFound { .. })
    ));
    assert_eq!(balance_of(store), 0);
}

#[test]
fn reward_writes_do_not_touch_the_ledger() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    seed_balance(store, 10);
    seed_reward(store, "Sticker", 5);
    assert_eq!(balance_of(store), 10);
}
