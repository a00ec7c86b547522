//! Runtime tuning knobs for the ledger core.
//!
//! # Responsibility
//! - Group store timing and retry settings in one serde-friendly value.
//!
//! # Invariants
//! - `Default` values are safe for a single-host SQLite deployment.

use crate::store::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_COMPENSATION_TIMEOUT_MS: u64 = 2_000;

/// Ledger core configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long SQLite waits on a locked database before reporting busy.
    pub busy_timeout_ms: u64,
    /// Store-level retry policy for transient lock contention.
    pub retry: RetryPolicy,
    /// Deadline given to the compensating delete of a failed accrual.
    pub compensation_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            retry: RetryPolicy::default(),
            compensation_timeout_ms: DEFAULT_COMPENSATION_TIMEOUT_MS,
        }
    }
}

impl LedgerConfig {
    pub fn compensation_timeout(&self) -> Duration {
        Duration::from_millis(self.compensation_timeout_ms)
    }
}
