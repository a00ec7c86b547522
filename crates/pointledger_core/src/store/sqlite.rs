//! SQLite implementation of the `Store` contract.
//!
//! # Responsibility
//! - Map records onto the four ledger tables and back.
//! - Run conditional multi-record writes inside one immediate transaction.
//! - Retry lock contention with bounded backoff under the caller's deadline.
//! - Bound SQLite's own lock wait by the caller's deadline and cancel flag.
//!
//! # Invariants
//! - Write paths validate records before SQL mutations.
//! - Single-record reads reject invalid persisted state; scans report it as
//!   `MalformedRow` instead of failing the whole table.
//! - Balance counters move only through single conditional statements.

use super::{
    Condition, MalformedRow, Record, RetryPolicy, ScanPage, Store, StoreError, StoreResult, Table,
    WriteOp,
};
use crate::config::LedgerConfig;
use crate::context::OpContext;
use crate::db::migrations::latest_version;
use crate::model::balance::{CurrentPoints, RewardHistory, CURRENT_POINTS_ID};
use crate::model::item::{Achievement, Reward, ValidationError};
use crate::model::now_epoch_ms;
use log::{debug, warn};
use rusqlite::types::FromSql;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Longest single lock wait handed to SQLite before the context is re-checked.
const LOCK_WAIT_SLICE: Duration = Duration::from_millis(25);

const REQUIRED_TABLES: [Table; 4] = [
    Table::Achievements,
    Table::Rewards,
    Table::CurrentPoints,
    Table::RewardHistory,
];

/// SQLite-backed store over one migrated connection.
///
/// Several `SqliteStore`s on separate connections to the same file behave
/// like independent service instances sharing one backing store.
#[derive(Debug, Clone, Copy)]
pub struct SqliteStore<'conn> {
    conn: &'conn Connection,
    retry: RetryPolicy,
    busy_timeout: Duration,
}

impl<'conn> SqliteStore<'conn> {
    /// Creates a store from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        ensure_store_connection_ready(conn)?;
        let defaults = LedgerConfig::default();
        Ok(Self {
            conn,
            retry: defaults.retry,
            busy_timeout: Duration::from_millis(defaults.busy_timeout_ms),
        })
    }

    /// Applies the retry policy and lock wait budget from `config`.
    pub fn with_config(mut self, config: &LedgerConfig) -> Self {
        self.retry = config.retry;
        self.busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn run<T>(
        &self,
        ctx: &OpContext,
        operation: &'static str,
        table: Table,
        mut attempt: impl FnMut(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut retries = 0;
        loop {
            ctx.check()?;
            match self.attempt_with_lock_wait(ctx, &mut attempt) {
                Err(err) if err.is_transient() && retries < self.retry.max_retries => {
                    ctx.check()?;
                    retries += 1;
                    let backoff = self.retry.backoff(retries);
                    let wait = ctx
                        .remaining()
                        .map_or(backoff, |remaining| backoff.min(remaining));
                    warn!(
                        "event=store_retry module=store status=retry operation={} table={} attempt={} wait_ms={} error={}",
                        operation,
                        table,
                        retries,
                        wait.as_millis(),
                        err
                    );
                    std::thread::sleep(wait);
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        "event=store_retry module=store status=exhausted operation={} table={} attempts={} error={}",
                        operation,
                        table,
                        retries + 1,
                        err
                    );
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    /// Runs one attempt, waiting on a locked database for at most the
    /// configured busy timeout and never past the caller's deadline.
    ///
    /// The wait is handed to SQLite in short slices so cancellation is
    /// observed while blocked. The connection's busy timeout is restored
    /// afterwards.
    fn attempt_with_lock_wait<T>(
        &self,
        ctx: &OpContext,
        attempt: &mut impl FnMut(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let started_at = Instant::now();
        let result = loop {
            let mut slice = self
                .busy_timeout
                .saturating_sub(started_at.elapsed())
                .min(LOCK_WAIT_SLICE);
            if let Some(remaining) = ctx.remaining() {
                slice = slice.min(remaining);
            }
            self.conn.busy_timeout(slice)?;

            match attempt(self.conn) {
                Err(err) if err.is_transient() && started_at.elapsed() < self.busy_timeout => {
                    if let Err(stop) = ctx.check() {
                        break Err(stop);
                    }
                }
                other => break other,
            }
        };
        self.conn.busy_timeout(self.busy_timeout)?;
        result
    }
}

impl Store for SqliteStore<'_> {
    fn get(&self, ctx: &OpContext, table: Table, key: &str) -> StoreResult<Record> {
        self.run(ctx, "get", table, |conn| {
            select_one(conn, table, key)?.ok_or_else(|| StoreError::NotFound {
                table,
                key: key.to_string(),
            })
        })
    }

    fn put(&self, ctx: &OpContext, record: &Record) -> StoreResult<()> {
        if record.table() == Table::CurrentPoints {
            return Err(StoreError::UnguardedBalanceWrite);
        }
        record.validate()?;
        self.run(ctx, "put", record.table(), |conn| put_record(conn, record))
    }

    fn scan(&self, ctx: &OpContext, table: Table) -> StoreResult<ScanPage> {
        self.run(ctx, "scan", table, |conn| scan_table(conn, table))
    }

    fn scan_with_balance(
        &self,
        ctx: &OpContext,
        table: Table,
    ) -> StoreResult<(ScanPage, Option<CurrentPoints>)> {
        self.run(ctx, "scan_with_balance", table, |conn| {
            // One read snapshot spans both SELECTs.
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Deferred)?;
            let page = scan_table(&tx, table)?;
            let balance = match select_one(&tx, Table::CurrentPoints, CURRENT_POINTS_ID)? {
                Some(Record::CurrentPoints(balance)) => Some(balance),
                Some(other) => {
                    return Err(StoreError::InvalidData(format!(
                        "expected balance record, got {} record",
                        other.table()
                    )))
                }
                None => None,
            };
            tx.commit()?;
            Ok((page, balance))
        })
    }

    fn delete(&self, ctx: &OpContext, table: Table, key: &str) -> StoreResult<()> {
        self.run(ctx, "delete", table, |conn| {
            if delete_record(conn, table, key)? == 0 {
                return Err(StoreError::NotFound {
                    table,
                    key: key.to_string(),
                });
            }
            Ok(())
        })
    }

    fn transact_write(&self, ctx: &OpContext, ops: &[WriteOp]) -> StoreResult<()> {
        for op in ops {
            if let WriteOp::Put { record, condition } = op {
                if record.table() == Table::CurrentPoints
                    && !matches!(condition, Condition::PointEquals(_))
                {
                    return Err(StoreError::UnguardedBalanceWrite);
                }
                record.validate()?;
            }
        }
        let table = ops.first().map_or(Table::CurrentPoints, WriteOp::table);

        let result = self.run(ctx, "transact_write", table, |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            for op in ops {
                apply_op(&tx, op)?;
            }
            tx.commit()?;
            Ok(())
        });

        if let Err(StoreError::ConditionFailed { table, key }) = &result {
            debug!(
                "event=store_condition_failed module=store status=rolled_back table={} key={} ops={}",
                table,
                key,
                ops.len()
            );
        }
        result
    }

    fn increment_counter(&self, ctx: &OpContext, delta: i64) -> StoreResult<CurrentPoints> {
        ensure_positive_delta(delta)?;
        self.run(ctx, "increment_counter", Table::CurrentPoints, |conn| {
            let balance = conn.query_row(
                "INSERT INTO current_points (id, point, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    point = current_points.point + excluded.point,
                    updated_at = excluded.updated_at
                 RETURNING point, updated_at;",
                params![CURRENT_POINTS_ID, delta, now_epoch_ms()],
                |row| Ok(CurrentPoints::with_point(row.get(0)?, row.get(1)?)),
            )?;
            Ok(balance)
        })
    }

    fn decrement_counter_if_sufficient(
        &self,
        ctx: &OpContext,
        delta: i64,
    ) -> StoreResult<Option<CurrentPoints>> {
        ensure_positive_delta(delta)?;
        self.run(ctx, "decrement_counter", Table::CurrentPoints, |conn| {
            let balance = conn
                .query_row(
                    "UPDATE current_points
                     SET point = point - ?2,
                         updated_at = ?3
                     WHERE id = ?1
                       AND point >= ?2
                     RETURNING point, updated_at;",
                    params![CURRENT_POINTS_ID, delta, now_epoch_ms()],
                    |row| Ok(CurrentPoints::with_point(row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(balance)
        })
    }
}

fn ensure_positive_delta(delta: i64) -> StoreResult<()> {
    if delta <= 0 {
        return Err(ValidationError::new(
            "delta",
            format!("counter delta must be positive, got {delta}"),
        )
        .into());
    }
    Ok(())
}

fn columns(table: Table) -> &'static str {
    match table {
        Table::Achievements | Table::Rewards => "id, title, description, point, created_at",
        Table::CurrentPoints => "id, point, updated_at",
        Table::RewardHistory => "id, reward_id, reward_title, point_cost, redeemed_at",
    }
}

fn select_one(conn: &Connection, table: Table, key: &str) -> StoreResult<Option<Record>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {table} WHERE id = ?1;",
        columns(table)
    ))?;
    let mut rows = stmt.query([key])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_row(table, row)?)),
        None => Ok(None),
    }
}

fn scan_table(conn: &Connection, table: Table) -> StoreResult<ScanPage> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM {table} ORDER BY id;", columns(table)))?;
    let mut rows = stmt.query([])?;
    let mut page = ScanPage::default();

    while let Some(row) = rows.next()? {
        match parse_row(table, row) {
            Ok(record) => page.records.push(record),
            Err(StoreError::InvalidData(reason)) => {
                let key = row
                    .get::<_, String>("id")
                    .unwrap_or_else(|_| "<unreadable>".to_string());
                page.malformed.push(MalformedRow { key, reason });
            }
            Err(err) => return Err(err),
        }
    }

    Ok(page)
}

fn put_record(conn: &Connection, record: &Record) -> StoreResult<()> {
    match record {
        Record::Achievement(achievement) => put_item(
            conn,
            Table::Achievements,
            achievement.id,
            &achievement.title,
            &achievement.description,
            achievement.point,
            achievement.created_at,
        ),
        Record::Reward(reward) => put_item(
            conn,
            Table::Rewards,
            reward.id,
            &reward.title,
            &reward.description,
            reward.point,
            reward.created_at,
        ),
        Record::CurrentPoints(balance) => {
            conn.execute(
                "INSERT INTO current_points (id, point, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    point = excluded.point,
                    updated_at = excluded.updated_at;",
                params![balance.id, balance.point, balance.updated_at],
            )?;
            Ok(())
        }
        Record::RewardHistory(history) => {
            conn.execute(
                "INSERT INTO reward_history (id, reward_id, reward_title, point_cost, redeemed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5);",
                params![
                    history.id.to_string(),
                    history.reward_id.to_string(),
                    history.reward_title.as_str(),
                    history.point_cost,
                    history.redeemed_at,
                ],
            )?;
            Ok(())
        }
    }
}

/// Upserts a catalog row; `created_at` is only written on first insert.
fn put_item(
    conn: &Connection,
    table: Table,
    id: Uuid,
    title: &str,
    description: &str,
    point: i64,
    created_at: i64,
) -> StoreResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO {table} (id, title, description, point, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                point = excluded.point;"
        ),
        params![id.to_string(), title, description, point, created_at],
    )?;
    Ok(())
}

fn delete_record(conn: &Connection, table: Table, key: &str) -> StoreResult<usize> {
    let changed = conn.execute(&format!("DELETE FROM {table} WHERE id = ?1;"), [key])?;
    Ok(changed)
}

fn apply_op(conn: &Connection, op: &WriteOp) -> StoreResult<()> {
    match op {
        WriteOp::Put { record, condition } => {
            check_condition(conn, record.table(), &record.key(), *condition)?;
            put_record(conn, record)
        }
        WriteOp::Delete {
            table,
            key,
            condition,
        } => {
            check_condition(conn, *table, key, *condition)?;
            if delete_record(conn, *table, key)? == 0 {
                return Err(StoreError::NotFound {
                    table: *table,
                    key: key.clone(),
                });
            }
            Ok(())
        }
    }
}

/// Evaluates `condition` under the caller's open write transaction.
fn check_condition(
    conn: &Connection,
    table: Table,
    key: &str,
    condition: Condition,
) -> StoreResult<()> {
    let holds = match condition {
        Condition::None => true,
        Condition::NotExists => !row_exists(conn, table, key)?,
        Condition::Exists => row_exists(conn, table, key)?,
        Condition::PointEquals(expected) => {
            if table == Table::RewardHistory {
                return Err(StoreError::InvalidData(
                    "point condition is not supported on reward_history".to_string(),
                ));
            }
            let stored: Option<i64> = conn
                .query_row(
                    &format!("SELECT point FROM {table} WHERE id = ?1;"),
                    [key],
                    |row| row.get(0),
                )
                .optional()?;
            match stored {
                Some(point) => point == expected,
                None => table == Table::CurrentPoints && expected == 0,
            }
        }
    };

    if holds {
        Ok(())
    } else {
        Err(StoreError::ConditionFailed {
            table,
            key: key.to_string(),
        })
    }
}

fn row_exists(conn: &Connection, table: Table, key: &str) -> StoreResult<bool> {
    let exists: i64 = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1);"),
        [key],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn parse_row(table: Table, row: &Row<'_>) -> StoreResult<Record> {
    match table {
        Table::Achievements => {
            let achievement = Achievement {
                id: parse_uuid(row, "id", table)?,
                title: column(row, "title")?,
                description: column(row, "description")?,
                point: column(row, "point")?,
                created_at: column(row, "created_at")?,
            };
            achievement
                .validate()
                .map_err(|err| invalid_row(table, &achievement.id, err))?;
            Ok(Record::Achievement(achievement))
        }
        Table::Rewards => {
            let reward = Reward {
                id: parse_uuid(row, "id", table)?,
                title: column(row, "title")?,
                description: column(row, "description")?,
                point: column(row, "point")?,
                created_at: column(row, "created_at")?,
            };
            reward
                .validate()
                .map_err(|err| invalid_row(table, &reward.id, err))?;
            Ok(Record::Reward(reward))
        }
        Table::CurrentPoints => {
            let balance = CurrentPoints {
                id: column(row, "id")?,
                point: column(row, "point")?,
                updated_at: column(row, "updated_at")?,
            };
            if balance.point < 0 {
                return Err(StoreError::InvalidData(format!(
                    "negative balance {} in current_points",
                    balance.point
                )));
            }
            Ok(Record::CurrentPoints(balance))
        }
        Table::RewardHistory => Ok(Record::RewardHistory(RewardHistory {
            id: parse_uuid(row, "id", table)?,
            reward_id: parse_uuid(row, "reward_id", table)?,
            reward_title: column(row, "reward_title")?,
            point_cost: column(row, "point_cost")?,
            redeemed_at: column(row, "redeemed_at")?,
        })),
    }
}

fn column<T: FromSql>(row: &Row<'_>, name: &str) -> StoreResult<T> {
    row.get::<_, T>(name).map_err(|err| match err {
        rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => {
            StoreError::InvalidData(format!("unreadable column `{name}`: {err}"))
        }
        other => other.into(),
    })
}

fn parse_uuid(row: &Row<'_>, name: &str, table: Table) -> StoreResult<Uuid> {
    let value: String = column(row, name)?;
    Uuid::parse_str(&value)
        .map_err(|_| StoreError::InvalidData(format!("invalid uuid `{value}` in {table}.{name}")))
}

fn invalid_row(table: Table, id: &Uuid, err: ValidationError) -> StoreError {
    StoreError::InvalidData(format!("{table} row {id}: {err}"))
}

fn ensure_store_connection_ready(conn: &Connection) -> StoreResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(StoreError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for table in REQUIRED_TABLES {
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table.as_str()],
            |row| row.get(0),
        )?;
        if exists != 1 {
            return Err(StoreError::MissingRequiredTable(table.as_str()));
        }
    }

    Ok(())
}
