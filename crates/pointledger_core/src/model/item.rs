//! Achievement and reward records.
//!
//! # Responsibility
//! - Define the two catalog records sharing one `{title, description, point}`
//!   shape, and the input draft used to create or replace them.
//!
//! # Invariants
//! - `title` is non-empty after trimming.
//! - `point` is strictly positive. For achievements it is an accrual amount,
//!   for rewards it is a cost.
//! - `id` and `created_at` never change after creation.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type AchievementId = Uuid;
pub type RewardId = Uuid;

/// Rejected input, reported before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid `{field}`: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Caller-editable fields of an achievement or reward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub point: i64,
}

impl ItemDraft {
    pub fn new(title: impl Into<String>, description: impl Into<String>, point: i64) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            point,
        }
    }

    /// Checks the title and point rules shared by achievements and rewards.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fields(&self.title, self.point)
    }
}

/// Completed achievement; its `point` is accrued once, at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub id: AchievementId,
    pub title: String,
    pub description: String,
    pub point: i64,
    /// Epoch ms; immutable.
    pub created_at: i64,
}

impl Achievement {
    /// Builds a new achievement with a fresh time-ordered id.
    pub fn create(draft: ItemDraft, created_at: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            title: draft.title,
            description: draft.description,
            point: draft.point,
            created_at,
        }
    }

    /// Replaces editable fields, keeping `id` and `created_at`.
    pub fn replace(&mut self, draft: ItemDraft) {
        self.title = draft.title;
        self.description = draft.description;
        self.point = draft.point;
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fields(&self.title, self.point)
    }
}

/// Redeemable reward; its `point` is a cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    pub id: RewardId,
    pub title: String,
    pub description: String,
    pub point: i64,
    pub created_at: i64,
}

impl Reward {
    pub fn create(draft: ItemDraft, created_at: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            title: draft.title,
            description: draft.description,
            point: draft.point,
            created_at,
        }
    }

    pub fn replace(&mut self, draft: ItemDraft) {
        self.title = draft.title;
        self.description = draft.description;
        self.point = draft.point;
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fields(&self.title, self.point)
    }
}

fn validate_fields(title: &str, point: i64) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::new("title", "title must not be empty"));
    }
    if point <= 0 {
        return Err(ValidationError::new(
            "point",
            format!("point must be greater than 0, got {point}"),
        ));
    }
    Ok(())
}
