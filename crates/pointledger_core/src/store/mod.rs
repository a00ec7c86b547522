//! Store contract consumed by the ledger and coordinators.
//!
//! # Responsibility
//! - Define key-value access (`get`/`put`/`scan`/`delete`) over the four
//!   ledger tables plus an all-or-nothing multi-record write.
//! - Expose the atomic counter primitives the balance singleton relies on.
//!
//! # Invariants
//! - `transact_write` applies every op or none of them.
//! - Counter primitives are single conditional statements, never a read
//!   followed by an unconditional write.
//! - A balance put is only accepted under `Condition::PointEquals`.
//! - Every call honours the caller's `OpContext` before doing I/O.

mod retry;
mod sqlite;

pub use retry::RetryPolicy;
pub use sqlite::SqliteStore;

use crate::context::OpContext;
use crate::db::DbError;
use crate::model::balance::{CurrentPoints, RewardHistory, CURRENT_POINTS_ID};
use crate::model::item::{Achievement, Reward, ValidationError};
use std::fmt::{Display, Formatter};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Store-level failure, after the store's own retry policy is exhausted.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("{table} record not found: {key}")]
    NotFound { table: Table, key: String },
    #[error("write condition failed on {table} record {key}")]
    ConditionFailed { table: Table, key: String },
    #[error("record rejected by store: {0}")]
    InvalidRecord(#[from] ValidationError),
    #[error("invalid persisted data: {0}")]
    InvalidData(String),
    #[error("balance writes must carry a `PointEquals` condition")]
    UnguardedBalanceWrite,
    #[error("store requires schema version {expected_version}, got {actual_version}")]
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    #[error("store requires table `{0}`")]
    MissingRequiredTable(&'static str),
    #[error("operation cancelled by caller")]
    Cancelled,
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
}

impl StoreError {
    /// Lock contention that the retry loop may wait out.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Db(err) if err.is_transient())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Logical table of a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Achievements,
    Rewards,
    CurrentPoints,
    RewardHistory,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Achievements => "achievements",
            Self::Rewards => "rewards",
            Self::CurrentPoints => "current_points",
            Self::RewardHistory => "reward_history",
        }
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted record of any ledger table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Achievement(Achievement),
    Reward(Reward),
    CurrentPoints(CurrentPoints),
    RewardHistory(RewardHistory),
}

impl Record {
    pub fn table(&self) -> Table {
        match self {
            Self::Achievement(_) => Table::Achievements,
            Self::Reward(_) => Table::Rewards,
            Self::CurrentPoints(_) => Table::CurrentPoints,
            Self::RewardHistory(_) => Table::RewardHistory,
        }
    }

    pub fn key(&self) -> String {
        match self {
            Self::Achievement(achievement) => achievement.id.to_string(),
            Self::Reward(reward) => reward.id.to_string(),
            Self::CurrentPoints(_) => CURRENT_POINTS_ID.to_string(),
            Self::RewardHistory(history) => history.id.to_string(),
        }
    }

    /// Write-side checks mirrored from the model, enforced before SQL runs.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Achievement(achievement) => achievement.validate(),
            Self::Reward(reward) => reward.validate(),
            Self::CurrentPoints(balance) => {
                if balance.id != CURRENT_POINTS_ID {
                    return Err(ValidationError::new(
                        "id",
                        format!("balance record must be keyed `{CURRENT_POINTS_ID}`"),
                    ));
                }
                if balance.point < 0 {
                    return Err(ValidationError::new("point", "balance must not be negative"));
                }
                Ok(())
            }
            Self::RewardHistory(history) => {
                if history.point_cost <= 0 {
                    return Err(ValidationError::new(
                        "point_cost",
                        "history cost must be greater than 0",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Precondition evaluated inside the write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    None,
    /// Target key must be absent.
    NotExists,
    /// Target key must be present.
    Exists,
    /// Stored `point` must equal the given value. An absent balance singleton
    /// counts as zero.
    PointEquals(i64),
}

/// One element of a transactional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { record: Record, condition: Condition },
    Delete { table: Table, key: String, condition: Condition },
}

impl WriteOp {
    pub fn put(record: Record) -> Self {
        Self::Put {
            record,
            condition: Condition::None,
        }
    }

    pub fn put_if(record: Record, condition: Condition) -> Self {
        Self::Put { record, condition }
    }

    /// Put that fails if the key already exists.
    pub fn insert(record: Record) -> Self {
        Self::put_if(record, Condition::NotExists)
    }

    pub fn delete(table: Table, key: impl Into<String>) -> Self {
        Self::Delete {
            table,
            key: key.into(),
            condition: Condition::None,
        }
    }

    pub fn table(&self) -> Table {
        match self {
            Self::Put { record, .. } => record.table(),
            Self::Delete { table, .. } => *table,
        }
    }
}

/// Row that could not be decoded during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRow {
    pub key: String,
    pub reason: String,
}

/// Result of a full-table scan.
///
/// Undecodable rows are reported next to the good ones so callers decide
/// whether to fail or skip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub records: Vec<Record>,
    pub malformed: Vec<MalformedRow>,
}

/// Key-value store with transactional multi-record writes.
pub trait Store {
    /// Loads one record; `StoreError::NotFound` when absent.
    fn get(&self, ctx: &OpContext, table: Table, key: &str) -> StoreResult<Record>;
    /// Inserts or replaces one record. Balance records are rejected with
    /// `UnguardedBalanceWrite`; they change only through the counters or a
    /// `PointEquals` write.
    fn put(&self, ctx: &OpContext, record: &Record) -> StoreResult<()>;
    /// Reads every record of a table.
    fn scan(&self, ctx: &OpContext, table: Table) -> StoreResult<ScanPage>;
    /// Reads every record of a table and the balance singleton from one
    /// snapshot. `None` when the balance was never written.
    fn scan_with_balance(
        &self,
        ctx: &OpContext,
        table: Table,
    ) -> StoreResult<(ScanPage, Option<CurrentPoints>)>;
    /// Deletes one record; `StoreError::NotFound` when absent.
    fn delete(&self, ctx: &OpContext, table: Table, key: &str) -> StoreResult<()>;
    /// Applies all ops atomically, checking each op's condition in-transaction.
    fn transact_write(&self, ctx: &OpContext, ops: &[WriteOp]) -> StoreResult<()>;
    /// Adds `delta` to the balance singleton in one statement, creating it if
    /// absent. Returns the new balance.
    fn increment_counter(&self, ctx: &OpContext, delta: i64) -> StoreResult<CurrentPoints>;
    /// Subtracts `delta` only if the stored balance is at least `delta`.
    /// Returns `None` when the condition does not hold.
    fn decrement_counter_if_sufficient(
        &self,
        ctx: &OpContext,
        delta: i64,
    ) -> StoreResult<Option<CurrentPoints>>;
}

impl<S: Store + ?Sized> Store for &S {
    fn get(&self, ctx: &OpContext, table: Table, key: &str) -> StoreResult<Record> {
        (**self).get(ctx, table, key)
    }

    fn put(&self, ctx: &OpContext, record: &Record) -> StoreResult<()> {
        (**self).put(ctx, record)
    }

    fn scan(&self, ctx: &OpContext, table: Table) -> StoreResult<ScanPage> {
        (**self).scan(ctx, table)
    }

    fn scan_with_balance(
        &self,
        ctx: &OpContext,
        table: Table,
    ) -> StoreResult<(ScanPage, Option<CurrentPoints>)> {
        (**self).scan_with_balance(ctx, table)
    }

    fn delete(&self, ctx: &OpContext, table: Table, key: &str) -> StoreResult<()> {
        (**self).delete(ctx, table, key)
    }

    fn transact_write(&self, ctx: &OpContext, ops: &[WriteOp]) -> StoreResult<()> {
        (**self).transact_write(ctx, ops)
    }

    fn increment_counter(&self, ctx: &OpContext, delta: i64) -> StoreResult<CurrentPoints> {
        (**self).increment_counter(ctx, delta)
    }

    fn decrement_counter_if_sufficient(
        &self,
        ctx: &OpContext,
        delta: i64,
    ) -> StoreResult<Option<CurrentPoints>> {
        (**self).decrement_counter_if_sufficient(ctx, delta)
    }
}
