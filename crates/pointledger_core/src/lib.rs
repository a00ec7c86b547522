//! Points ledger consistency engine.
//!
//! Achievements accrue points, rewards consume them, and the single balance
//! record stays consistent across concurrent callers and partial failures.
//! This crate is the single source of truth for those invariants.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod service;
pub mod store;

pub use config::LedgerConfig;
pub use context::{CancelHandle, OpContext};
pub use error::{BusinessRule, Entity, PointsError, PointsResult};
pub use ledger::{Ledger, StagedDebit};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::balance::{AggregatePoints, CurrentPoints, RewardHistory, CURRENT_POINTS_ID};
pub use model::item::{Achievement, AchievementId, ItemDraft, Reward, RewardId, ValidationError};
pub use service::accrual::AccrualCoordinator;
pub use service::reconciliation::ReconciliationReporter;
pub use service::redemption::{Redemption, RedemptionCoordinator};
pub use service::reward::RewardService;
pub use store::{
    Condition, MalformedRow, Record, RetryPolicy, ScanPage, SqliteStore, Store, StoreError,
    StoreResult, Table, WriteOp,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
