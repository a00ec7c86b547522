//! Domain model for the points economy.
//!
//! # Responsibility
//! - Define the persisted logical records and their validation rules.
//!
//! # Invariants
//! - Every achievement, reward and history entry has a time-ordered `Uuid`.
//! - Timestamps are Unix epoch milliseconds.

pub mod balance;
pub mod item;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock in epoch milliseconds; clamps pre-epoch clocks to zero.
pub(crate) fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}
