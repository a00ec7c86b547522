//! Ledger-side records: balance singleton, redemption history, drift report.
//!
//! # Invariants
//! - There is exactly one logical `CurrentPoints`, keyed `"current"`.
//! - `CurrentPoints.point` is never negative.
//! - `RewardHistory` entries are append-only snapshots.

use crate::model::item::{Reward, RewardId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed key of the balance singleton.
pub const CURRENT_POINTS_ID: &str = "current";

pub type RewardHistoryId = Uuid;

/// The singleton point balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentPoints {
    pub id: String,
    pub point: i64,
    pub updated_at: i64,
}

impl CurrentPoints {
    /// Balance reported before any accrual has been written.
    pub fn zero() -> Self {
        Self {
            id: CURRENT_POINTS_ID.to_string(),
            point: 0,
            updated_at: 0,
        }
    }

    pub fn with_point(point: i64, updated_at: i64) -> Self {
        Self {
            id: CURRENT_POINTS_ID.to_string(),
            point,
            updated_at,
        }
    }
}

/// Immutable audit record of one redemption.
///
/// `reward_title` and `point_cost` are snapshots taken at redemption time, so
/// later reward edits or deletion do not rewrite history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardHistory {
    pub id: RewardHistoryId,
    pub reward_id: RewardId,
    pub reward_title: String,
    pub point_cost: i64,
    pub redeemed_at: i64,
}

impl RewardHistory {
    pub fn snapshot(reward: &Reward, redeemed_at: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            reward_id: reward.id,
            reward_title: reward.title.clone(),
            point_cost: reward.point,
            redeemed_at,
        }
    }
}

/// Drift diagnostic between accrued achievement points and the balance.
///
/// `difference` is expected to be positive once any redemption happened; it
/// is a signal, never corrected automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatePoints {
    pub total_achievements: u64,
    pub total_points: i64,
    pub current_balance: i64,
    pub difference: i64,
}

impl AggregatePoints {
    pub fn new(total_achievements: u64, total_points: i64, current_balance: i64) -> Self {
        Self {
            total_achievements,
            total_points,
            current_balance,
            difference: total_points.saturating_sub(current_balance),
        }
    }
}
