//! Patch set model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Gerrit's classification of how a patch set differs from its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PatchSetKind {
    Rework,
    TrivialRebase,
    MergeFirstParentUpdate,
    NoCodeChange,
    NoChange,
}

impl From<&str> for PatchSetKind {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "TRIVIAL_REBASE" => Self::TrivialRebase,
            "MERGE_FIRST_PARENT_UPDATE" => Self::MergeFirstParentUpdate,
            "NO_CODE_CHANGE" => Self::NoCodeChange,
            "NO_CHANGE" => Self::NoChange,
            _ => Self::Rework,
        }
    }
}

/// An immutable revision of a change.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PatchSet {
    pub id: i64,
    pub change_id: i64,
    pub number: i64,
    /// Commit SHA of this revision.
    pub revision: String,
    pub author: String,
    pub kind: PatchSetKind,
    pub is_current: bool,
    pub created_at: i64,
}
