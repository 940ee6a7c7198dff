//! Change model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::fmt;

/// Remote status of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ChangeStatus {
    New,
    Draft,
    Merged,
    Abandoned,
}

impl ChangeStatus {
    /// Whether the change still accepts votes and new patch sets.
    pub fn is_open(self) -> bool {
        matches!(self, Self::New | Self::Draft)
    }
}

impl From<&str> for ChangeStatus {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "MERGED" => Self::Merged,
            "ABANDONED" => Self::Abandoned,
            "DRAFT" => Self::Draft,
            _ => Self::New,
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Draft => write!(f, "draft"),
            Self::Merged => write!(f, "merged"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Progress of the local import of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    Importing,
    Imported,
    Failed,
    /// A newer patch set exists remotely; re-import to fetch its files.
    Outdated,
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Importing => write!(f, "importing"),
            Self::Imported => write!(f, "imported"),
            Self::Failed => write!(f, "failed"),
            Self::Outdated => write!(f, "outdated"),
        }
    }
}

/// Summary of the open conflicts on a change.
///
/// Anything other than `None` pauses the change's queue entries.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ConflictStatus {
    #[default]
    None,
    CommentsPending,
    PatchSetUpdated,
    ManualResolutionRequired,
}

impl ConflictStatus {
    pub fn blocks_push(self) -> bool {
        self != Self::None
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::CommentsPending => write!(f, "comments_pending"),
            Self::PatchSetUpdated => write!(f, "patch_set_updated"),
            Self::ManualResolutionRequired => write!(f, "manual_resolution_required"),
        }
    }
}

/// Typed extension data stored alongside a change.
///
/// Unknown keys are dropped and missing keys take defaults, so older rows
/// keep loading as fields are added.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeExtensions {
    pub topic: Option<String>,
    pub hashtags: Vec<String>,
    /// The current user's votes as last confirmed with the server. This is
    /// the common ancestor for three-way vote comparison.
    pub baseline_votes: BTreeMap<String, i32>,
}

/// An imported review unit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Change {
    pub id: i64,
    pub instance_id: i64,

    /// Gerrit change identifier (`project~branch~Change-Id` or Change-Id).
    pub remote_change_id: String,

    /// Gerrit change number.
    pub number: i64,

    pub project: String,
    pub branch: String,
    pub subject: String,
    pub status: ChangeStatus,
    pub owner: String,
    pub current_revision: String,
    pub current_patch_set_num: i64,

    /// Files in the current patch set.
    pub total_files: i64,

    /// Files of the current patch set marked reviewed. Never exceeds `total_files`.
    pub reviewed_files: i64,

    pub total_comments: i64,
    pub import_status: ImportStatus,
    pub conflict_status: ConflictStatus,

    /// Remote `updated` timestamp at the last pull (Unix).
    pub remote_updated_at: Option<i64>,

    /// Last successful pull or import (Unix).
    pub last_sync: Option<i64>,

    #[sqlx(json)]
    pub extensions: ChangeExtensions,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Change {
    pub fn is_imported(&self) -> bool {
        matches!(self.import_status, ImportStatus::Imported | ImportStatus::Outdated)
    }
}
