use pointledger_core::db::{open_db, open_db_in_memory, open_db_with_config};
use pointledger_core::{
    AccrualCoordinator, Achievement, Condition, CurrentPoints, ItemDraft, Ledger, LedgerConfig,
    OpContext, PointsError, Record, RetryPolicy, Reward, RewardHistory, SqliteStore, Store,
    StoreError, Table, WriteOp,
};
use std::thread;
use std::time::{Duration, Instant};

fn achievement(title: &str, point: i64) -> Achievement {
    Achievement::create(ItemDraft::new(title, "desc", point), 1_000)
}

#[test]
fn get_missing_record_returns_not_found() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();

    let err = store.get(&ctx, Table::Achievements, "missing").unwrap_err();
    assert!(matches!(
        err,
        StoreError::NotFound {
            table: Table::Achievements,
            ref key,
        } if key == "missing"
    ));
}

#[test]
fn put_then_get_roundtrip_and_replace_keeps_created_at() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();

    let mut item = achievement("Ran 5k", 50);
    store.put(&ctx, &Record::Achievement(item.clone())).unwrap();
    let loaded = store
        .get(&ctx, Table::Achievements, &item.id.to_string())
        .unwrap();
    assert_eq!(loaded, Record::Achievement(item.clone()));

    item.replace(ItemDraft::new("Ran 10k", "longer", 80));
    let mut tampered = item.clone();
    tampered.created_at = 9_999;
    store.put(&ctx, &Record::Achievement(tampered)).unwrap();

    let Record::Achievement(reloaded) = store
        .get(&ctx, Table::Achievements, &item.id.to_string())
        .unwrap()
    else {
        panic!("expected achievement record");
    };
    assert_eq!(reloaded.title, "Ran 10k");
    assert_eq!(reloaded.point, 80);
    assert_eq!(reloaded.created_at, 1_000);
}

#[test]
fn put_rejects_invalid_record_before_writing() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();

    let mut invalid = achievement("x", 10);
    invalid.point = 0;
    let err = store
        .put(&ctx, &Record::Achievement(invalid))
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidRecord(ref v) if v.field == "point"));
    assert!(store
        .scan(&ctx, Table::Achievements)
        .unwrap()
        .records
        .is_empty());
}

#[test]
fn delete_missing_record_returns_not_found() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();

    let err = store.delete(&ctx, Table::Rewards, "nope").unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[test]
fn transact_write_rolls_back_all_ops_when_a_condition_fails() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();
    store.increment_counter(&ctx, 100).unwrap();

    let first = achievement("first", 10);
    let ops = [
        WriteOp::insert(Record::Achievement(first.clone())),
        WriteOp::put_if(
            Record::CurrentPoints(CurrentPoints::with_point(40, 2)),
            Condition::PointEquals(99),
        ),
    ];
    let err = store.transact_write(&ctx, &ops).unwrap_err();
    assert!(matches!(
        err,
        StoreError::ConditionFailed {
            table: Table::CurrentPoints,
            ..
        }
    ));

    assert!(matches!(
        store.get(&ctx, Table::Achievements, &first.id.to_string()),
        Err(StoreError::NotFound { .. })
    ));
    let Record::CurrentPoints(balance) = store
        .get(&ctx, Table::CurrentPoints, "current")
        .unwrap()
    else {
        panic!("expected balance record");
    };
    assert_eq!(balance.point, 100);
}

#[test]
fn transact_write_applies_all_ops_when_conditions_hold() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();
    store.increment_counter(&ctx, 100).unwrap();

    let reward = Reward::create(ItemDraft::new("Coffee", "", 30), 5);
    let history = RewardHistory::snapshot(&reward, 6);
    store
        .transact_write(
            &ctx,
            &[
                WriteOp::put_if(
                    Record::CurrentPoints(CurrentPoints::with_point(70, 6)),
                    Condition::PointEquals(100),
                ),
                WriteOp::insert(Record::RewardHistory(history.clone())),
            ],
        )
        .unwrap();

    let page = store.scan(&ctx, Table::RewardHistory).unwrap();
    assert_eq!(page.records, vec![Record::RewardHistory(history)]);
}

#[test]
fn point_condition_treats_absent_balance_as_zero() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();

    store
        .transact_write(
            &ctx,
            &[WriteOp::put_if(
                Record::CurrentPoints(CurrentPoints::with_point(5, 1)),
                Condition::PointEquals(0),
            )],
        )
        .unwrap();
    assert_eq!(
        store.get(&ctx, Table::CurrentPoints, "current").unwrap(),
        Record::CurrentPoints(CurrentPoints::with_point(5, 1))
    );
}

#[test]
fn insert_condition_rejects_duplicate_keys() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();

    let item = achievement("once", 1);
    let op = WriteOp::insert(Record::Achievement(item));
    store.transact_write(&ctx, &[op.clone()]).unwrap();
    let err = store.transact_write(&ctx, &[op]).unwrap_err();
    assert!(matches!(err, StoreError::ConditionFailed { .. }));
}

#[test]
fn reward_history_is_append_only() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();

    let reward = Reward::create(ItemDraft::new("Movie", "", 20), 1);
    let history = RewardHistory::snapshot(&reward, 2);
    store
        .put(&ctx, &Record::RewardHistory(history.clone()))
        .unwrap();

    assert!(store
        .put(&ctx, &Record::RewardHistory(history.clone()))
        .is_err());
    assert!(store
        .delete(&ctx, Table::RewardHistory, &history.id.to_string())
        .is_err());
    assert!(conn
        .execute("UPDATE reward_history SET point_cost = 1;", [])
        .is_err());
    assert_eq!(store.scan(&ctx, Table::RewardHistory).unwrap().records.len(), 1);
}

#[test]
fn scan_reports_malformed_rows_without_failing() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();

    store
        .put(&ctx, &Record::Achievement(achievement("good", 10)))
        .unwrap();
    conn.execute(
        "INSERT INTO achievements (id, title, description, point, created_at)
         VALUES ('not-a-uuid', 'bad id', '', 5, 0);",
        [],
    )
    .unwrap();

    let page = store.scan(&ctx, Table::Achievements).unwrap();
    assert_eq!(page.records.len(), 1);
    assert_eq!(page.malformed.len(), 1);
    assert_eq!(page.malformed[0].key, "not-a-uuid");

    let err = store
        .get(&ctx, Table::Achievements, "not-a-uuid")
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));
}

#[test]
fn counters_reject_non_positive_delta() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();

    assert!(matches!(
        store.increment_counter(&ctx, 0),
        Err(StoreError::InvalidRecord(_))
    ));
    assert!(matches!(
        store.decrement_counter_if_sufficient(&ctx, -3),
        Err(StoreError::InvalidRecord(_))
    ));
}

#[test]
fn decrement_counter_on_absent_balance_is_not_applied() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();

    assert_eq!(store.decrement_counter_if_sufficient(&ctx, 1).unwrap(), None);
    assert_eq!(store.increment_counter(&ctx, 7).unwrap().point, 7);
    assert_eq!(
        store
            .decrement_counter_if_sufficient(&ctx, 7)
            .unwrap()
            .map(|balance| balance.point),
        Some(0)
    );
}

#[test]
fn expired_or_cancelled_context_stops_before_io() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();

    let expired = OpContext::with_deadline(Instant::now() - Duration::from_millis(1));
    assert!(matches!(
        store.increment_counter(&expired, 10),
        Err(StoreError::DeadlineExceeded)
    ));

    let cancelled = OpContext::background();
    cancelled.cancel_handle().cancel();
    assert!(matches!(
        store.scan(&cancelled, Table::Achievements),
        Err(StoreError::Cancelled)
    ));

    let ctx = OpContext::background();
    assert!(matches!(
        store.get(&ctx, Table::CurrentPoints, "current"),
        Err(StoreError::NotFound { .. })
    ));
}

#[test]
fn locked_database_is_retried_then_surfaced_as_transient() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.db");
    let config = LedgerConfig {
        busy_timeout_ms: 0,
        ..LedgerConfig::default()
    };

    let holder = open_db_with_config(&path, &config).unwrap();
    let conn = open_db_with_config(&path, &config).unwrap();
    let store = SqliteStore::try_new(&conn)
        .unwrap()
        .with_config(&config)
        .with_retry_policy(RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2,
        });
    let ctx = OpContext::background();

    holder.execute_batch("BEGIN IMMEDIATE;").unwrap();
    let err = store.increment_counter(&ctx, 5).unwrap_err();
    assert!(err.is_transient(), "unexpected error: {err}");
    holder.execute_batch("COMMIT;").unwrap();

    assert_eq!(store.increment_counter(&ctx, 5).unwrap().point, 5);
}

const LOCK_WAIT_MARGIN: Duration = Duration::from_millis(500);

#[test]
fn lock_wait_stops_at_the_caller_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deadline.db");
    let holder = open_db(&path).unwrap();
    let conn = open_db(&path).unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    holder.execute_batch("BEGIN IMMEDIATE;").unwrap();

    let timeout = Duration::from_millis(100);
    let started = Instant::now();
    let err = store
        .increment_counter(&OpContext::with_timeout(timeout), 5)
        .unwrap_err();
    assert!(matches!(err, StoreError::DeadlineExceeded), "got {err}");
    assert!(started.elapsed() < timeout + LOCK_WAIT_MARGIN);

    let started = Instant::now();
    let err = Ledger::new(store)
        .increment(&OpContext::with_timeout(timeout), 5)
        .unwrap_err();
    assert!(matches!(
        err,
        PointsError::Database {
            source: StoreError::DeadlineExceeded,
            ..
        }
    ));
    assert!(started.elapsed() < timeout + LOCK_WAIT_MARGIN);

    let started = Instant::now();
    let err = AccrualCoordinator::new(store)
        .create(
            &OpContext::with_timeout(timeout),
            ItemDraft::new("blocked", "", 10),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PointsError::Database {
            source: StoreError::DeadlineExceeded,
            ..
        }
    ));
    assert!(started.elapsed() < timeout + LOCK_WAIT_MARGIN);

    holder.execute_batch("ROLLBACK;").unwrap();
    assert_eq!(
        store
            .scan(&OpContext::background(), Table::Achievements)
            .unwrap()
            .records
            .len(),
        0
    );
}

#[test]
fn cancel_interrupts_lock_wait() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cancel.db");
    let holder = open_db(&path).unwrap();
    let conn = open_db(&path).unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    holder.execute_batch("BEGIN IMMEDIATE;").unwrap();

    let ctx = OpContext::background();
    let handle = ctx.cancel_handle();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.cancel();
    });

    let started = Instant::now();
    let err = store.increment_counter(&ctx, 5).unwrap_err();
    canceller.join().unwrap();
    assert!(matches!(err, StoreError::Cancelled), "got {err}");
    assert!(started.elapsed() < Duration::from_millis(50) + LOCK_WAIT_MARGIN);

    // The configured busy timeout is back in place for direct connection use.
    let busy_ms: i64 = conn
        .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(busy_ms, 5_000);
}

#[test]
fn balance_writes_without_point_condition_are_rejected() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();
    store.increment_counter(&ctx, 50).unwrap();

    let overwrite = Record::CurrentPoints(CurrentPoints::with_point(1_000, 9));
    assert!(matches!(
        store.put(&ctx, &overwrite),
        Err(StoreError::UnguardedBalanceWrite)
    ));
    for condition in [Condition::None, Condition::Exists, Condition::NotExists] {
        assert!(matches!(
            store.transact_write(&ctx, &[WriteOp::put_if(overwrite.clone(), condition)]),
            Err(StoreError::UnguardedBalanceWrite)
        ));
    }

    let Record::CurrentPoints(balance) = store
        .get(&ctx, Table::CurrentPoints, "current")
        .unwrap()
    else {
        panic!("expected balance record");
    };
    assert_eq!(balance.point, 50);
}

#[test]
fn scan_with_balance_reads_both_sides() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let ctx = OpContext::background();

    let (page, balance) = store.scan_with_balance(&ctx, Table::Achievements).unwrap();
    assert!(page.records.is_empty());
    assert_eq!(balance, None);

    store
        .put(&ctx, &Record::Achievement(achievement("one", 12)))
        .unwrap();
    store.increment_counter(&ctx, 12).unwrap();
    let (page, balance) = store.scan_with_balance(&ctx, Table::Achievements).unwrap();
    assert_eq!(page.records.len(), 1);
    assert_eq!(balance.map(|balance| balance.point), Some(12));
}
