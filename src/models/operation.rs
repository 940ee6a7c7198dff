//! Operation queue entry model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Kind of remote mutation an entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum OperationType {
    AddComment,
    UpdateComment,
    DeleteComment,
    SubmitReview,
    UpdateLabels,
    PushPatchSet,
}

impl OperationType {
    pub fn is_comment_operation(self) -> bool {
        matches!(self, Self::AddComment | Self::UpdateComment | Self::DeleteComment)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddComment => "add_comment",
            Self::UpdateComment => "update_comment",
            Self::DeleteComment => "delete_comment",
            Self::SubmitReview => "submit_review",
            Self::UpdateLabels => "update_labels",
            Self::PushPatchSet => "push_patch_set",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Processing,
    Completed,
    /// Terminal until retried manually.
    Failed,
    Cancelled,
    /// Blocked behind `depends_on`.
    WaitingForDependency,
}

impl OperationStatus {
    /// Statuses whose entry may still reach the server.
    pub fn is_unfinished(self) -> bool {
        matches!(self, Self::Queued | Self::Processing | Self::WaitingForDependency)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::WaitingForDependency => write!(f, "waiting_for_dependency"),
        }
    }
}

/// Scheduling priority. Stored as an integer so it sorts in SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// A single file modification in a pushed patch set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    /// New content; `None` deletes the file.
    pub content: Option<String>,
}

/// Operation payload. Entries reference local rows by id and read their
/// current content when executed, so edits made while queued are sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationPayload {
    AddComment { comment_id: i64 },
    UpdateComment { comment_id: i64 },
    DeleteComment { comment_id: i64, remote_id: String },
    SubmitReview { review_id: i64 },
    UpdateLabels { review_id: i64 },
    PushPatchSet { edits: Vec<FileEdit>, message: String },
}

impl OperationPayload {
    pub fn operation_type(&self) -> OperationType {
        match self {
            Self::AddComment { .. } => OperationType::AddComment,
            Self::UpdateComment { .. } => OperationType::UpdateComment,
            Self::DeleteComment { .. } => OperationType::DeleteComment,
            Self::SubmitReview { .. } => OperationType::SubmitReview,
            Self::UpdateLabels { .. } => OperationType::UpdateLabels,
            Self::PushPatchSet { .. } => OperationType::PushPatchSet,
        }
    }

    /// Priority used when the caller does not pick one.
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::UpdateLabels { .. } | Self::PushPatchSet { .. } => Priority::High,
            Self::DeleteComment { .. } => Priority::Low,
            _ => Priority::Normal,
        }
    }

    pub fn comment_id(&self) -> Option<i64> {
        match self {
            Self::AddComment { comment_id }
            | Self::UpdateComment { comment_id }
            | Self::DeleteComment { comment_id, .. } => Some(*comment_id),
            _ => None,
        }
    }

    pub fn review_id(&self) -> Option<i64> {
        match self {
            Self::SubmitReview { review_id } | Self::UpdateLabels { review_id } => Some(*review_id),
            _ => None,
        }
    }
}

/// A pending remote mutation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OperationQueueEntry {
    pub id: i64,
    pub change_id: i64,
    pub operation_type: OperationType,
    #[sqlx(json)]
    pub payload: OperationPayload,
    pub priority: Priority,
    pub status: OperationStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    /// Earliest time (Unix) the entry may run again.
    pub next_retry: Option<i64>,
    /// Preceding entry of the same change this one waits on.
    pub depends_on: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl OperationQueueEntry {
    /// Whether another failure would still be retried.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Input for `operation_queue::enqueue`.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub change_id: i64,
    pub payload: OperationPayload,
    pub priority: Option<Priority>,
}

impl NewOperation {
    pub fn new(change_id: i64, payload: OperationPayload) -> Self {
        Self {
            change_id,
            payload,
            priority: None,
        }
    }
}
