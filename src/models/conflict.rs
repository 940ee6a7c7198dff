//! Conflict model: a recorded divergence between local and remote state.

use super::change::ChangeStatus;
use super::comment::{CommentRange, CommentSide};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ConflictKind {
    Comment,
    ReviewState,
    PatchSet,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ConflictState {
    Open,
    Resolved,
}

/// How to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Apply both sides when they touch disjoint lines or fields.
    #[default]
    AutoMerge,
    LocalWins,
    RemoteWins,
    /// Park the change until the user decides.
    ManualResolutionRequired,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoMerge => write!(f, "auto_merge"),
            Self::LocalWins => write!(f, "local_wins"),
            Self::RemoteWins => write!(f, "remote_wins"),
            Self::ManualResolutionRequired => write!(f, "manual_resolution_required"),
        }
    }
}

/// Remote copy of a comment as seen during a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentSnapshot {
    pub remote_id: String,
    pub patch_set: i64,
    pub file_path: String,
    pub side: CommentSide,
    pub line: Option<i64>,
    pub range: Option<CommentRange>,
    pub message: String,
    pub author: String,
    pub unresolved: bool,
    pub updated: i64,
}

/// Everything needed to apply either side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictDetail {
    /// A local comment against a remote comment.
    ///
    /// With `new_remote = true` the remote comment is unknown locally and
    /// overlaps a pending local comment; otherwise it is the remote copy of
    /// the (locally modified) comment itself.
    Comment {
        comment_id: i64,
        remote: CommentSnapshot,
        new_remote: bool,
    },
    ReviewState {
        review_id: i64,
        local: BTreeMap<String, i32>,
        remote: BTreeMap<String, i32>,
        baseline: BTreeMap<String, i32>,
    },
    PatchSet {
        local_patch_set: i64,
        remote_patch_set: i64,
        remote_revision: String,
    },
    Status {
        local: ChangeStatus,
        remote: ChangeStatus,
    },
}

impl ConflictDetail {
    pub fn kind(&self) -> ConflictKind {
        match self {
            Self::Comment { .. } => ConflictKind::Comment,
            Self::ReviewState { .. } => ConflictKind::ReviewState,
            Self::PatchSet { .. } => ConflictKind::PatchSet,
            Self::Status { .. } => ConflictKind::Status,
        }
    }

    /// Identity of the conflicting subject. A second detection of the same
    /// subject refreshes the open conflict instead of adding a new one.
    pub fn subject_key(&self) -> String {
        match self {
            Self::Comment {
                comment_id, remote, ..
            } => format!("comment:{}:{}", comment_id, remote.remote_id),
            Self::ReviewState { review_id, .. } => format!("review:{}", review_id),
            Self::PatchSet { .. } => "patch_set".to_string(),
            Self::Status { .. } => "status".to_string(),
        }
    }
}

/// A detected divergence.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Conflict {
    pub id: i64,
    pub change_id: i64,
    pub kind: ConflictKind,
    #[sqlx(json)]
    pub detail: ConflictDetail,
    pub state: ConflictState,
    /// Strategy applied (resolved) or requested (open, manual).
    pub resolution: Option<ResolutionStrategy>,
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
}

impl Conflict {
    pub fn is_open(&self) -> bool {
        self.state == ConflictState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_kind_and_key() {
        let detail = ConflictDetail::PatchSet {
            local_patch_set: 3,
            remote_patch_set: 4,
            remote_revision: "abc".into(),
        };
        assert_eq!(detail.kind(), ConflictKind::PatchSet);
        assert_eq!(detail.subject_key(), "patch_set");

        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["kind"], "patch_set");
        assert_eq!(json["remote_patch_set"], 4);
    }
}
