//! Per-run sync bookkeeping.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Scope of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SyncType {
    /// Pull every tracked change, then push.
    Full,
    /// Like `Full`, but skips resolving changes the server reports unchanged.
    #[default]
    Incremental,
    /// Pull comments and push only comment operations.
    CommentsOnly,
    /// Pull change metadata; never push.
    StatusOnly,
    /// Pull and push only changes with pending operations.
    PushLocal,
}

impl SyncType {
    pub fn fetches_comments(self) -> bool {
        self != Self::StatusOnly
    }

    pub fn pushes(self) -> bool {
        self != Self::StatusOnly
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
            Self::CommentsOnly => write!(f, "comments_only"),
            Self::StatusOnly => write!(f, "status_only"),
            Self::PushLocal => write!(f, "push_local"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SyncRunState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Record of one sync run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncRun {
    pub id: i64,
    pub instance_id: i64,
    pub sync_type: SyncType,
    pub state: SyncRunState,
    pub items_processed: i64,
    pub items_total: i64,
    pub conflicts_detected: i64,
    #[sqlx(json)]
    pub errors: Vec<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}
