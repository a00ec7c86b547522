//! Structured error taxonomy returned by every coordinator call.
//!
//! Presentation layers map variants to protocol status codes by matching,
//! never by inspecting message text.

use crate::model::item::{AchievementId, ValidationError};
use crate::store::{StoreError, Table};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Result type alias for coordinator operations.
pub type PointsResult<T> = Result<T, PointsError>;

/// Entity kinds addressable by id through the coordinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Achievement,
    Reward,
}

impl Display for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Achievement => f.write_str("achievement"),
            Self::Reward => f.write_str("reward"),
        }
    }
}

/// Domain rule that rejected an otherwise well-formed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusinessRule {
    /// Balance does not cover the requested debit.
    InsufficientPoints { required: i64, available: i64 },
    /// Balance changed between read and conditional write.
    ConcurrentModification,
}

impl Display for BusinessRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientPoints {
                required,
                available,
            } => write!(
                f,
                "insufficient points: required {required}, available {available}"
            ),
            Self::ConcurrentModification => f.write_str("balance changed concurrently"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PointsError {
    /// Malformed input, rejected before any side effect.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Domain rule violated after reads, before any mutation.
    #[error("{operation} rejected: {reason}")]
    BusinessLogic {
        operation: &'static str,
        reason: BusinessRule,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },

    /// Store failure after the store's own retries were exhausted.
    #[error("database error during {operation} on {table}: {source}")]
    Database {
        operation: &'static str,
        table: Table,
        source: StoreError,
    },

    /// Accrual failed and its compensating delete failed too. The achievement
    /// is persisted without its points and needs manual reconciliation.
    #[error(
        "achievement {achievement_id} persisted without accrual ({accrual_error}); compensation failed: {compensation_error}"
    )]
    Composite {
        achievement_id: AchievementId,
        #[source]
        accrual_error: Box<PointsError>,
        compensation_error: Box<PointsError>,
    },
}

impl PointsError {
    pub fn database(operation: &'static str, table: Table, source: StoreError) -> Self {
        Self::Database {
            operation,
            table,
            source,
        }
    }

    pub fn insufficient_points(operation: &'static str, required: i64, available: i64) -> Self {
        Self::BusinessLogic {
            operation,
            reason: BusinessRule::InsufficientPoints {
                required,
                available,
            },
        }
    }

    pub fn is_insufficient_points(&self) -> bool {
        matches!(
            self,
            Self::BusinessLogic {
                reason: BusinessRule::InsufficientPoints { .. },
                ..
            }
        )
    }

    pub fn is_concurrent_modification(&self) -> bool {
        matches!(
            self,
            Self::BusinessLogic {
                reason: BusinessRule::ConcurrentModification,
                ..
            }
        )
    }

    /// True when stored state is known to be inconsistent.
    pub fn is_inconsistent_state(&self) -> bool {
        matches!(self, Self::Composite { .. })
    }

    /// Whether a caller may reasonably resubmit the same request.
    ///
    /// Only an optimistic-concurrency loss qualifies; store errors were
    /// already retried and composite failures need an operator.
    pub fn is_retryable(&self) -> bool {
        self.is_concurrent_modification()
    }
}
