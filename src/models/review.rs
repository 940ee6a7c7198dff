//! Review (message + votes + comments) model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ReviewStatus {
    Draft,
    PendingSubmission,
    Submitted,
    SubmissionFailed,
    /// Posted, but some of the bundled comments never reached the server.
    PartiallySubmitted,
}

/// A review submission.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Review {
    pub id: i64,
    pub change_id: i64,
    pub patch_set_id: i64,
    pub message: String,

    /// Label name → vote, e.g. `Code-Review: +1`.
    #[sqlx(json)]
    pub labels: BTreeMap<String, i32>,

    /// Local comment ids published with this review.
    #[sqlx(json)]
    pub comment_ids: Vec<i64>,

    pub status: ReviewStatus,
    pub submitted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Review {
    /// Inclusive vote range accepted for any label.
    pub const VOTE_RANGE: std::ops::RangeInclusive<i32> = -2..=2;
}
