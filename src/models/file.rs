//! File-within-a-patch-set model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// How a file changed in a patch set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FileChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
    Rewritten,
}

impl From<&str> for FileChangeType {
    /// Parse Gerrit's single-letter `FileInfo.status` (absent means modified).
    fn from(s: &str) -> Self {
        match s {
            "A" => Self::Added,
            "D" => Self::Deleted,
            "R" => Self::Renamed,
            "C" => Self::Copied,
            "W" => Self::Rewritten,
            _ => Self::Modified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FileReviewStatus {
    Unreviewed,
    Reviewed,
}

/// A file within a patch set.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChangeFile {
    pub id: i64,
    pub change_id: i64,
    pub patch_set_id: i64,
    pub path: String,
    /// Previous path for renames and copies.
    pub old_path: Option<String>,
    pub change_type: FileChangeType,
    pub review_status: FileReviewStatus,
    pub lines_inserted: i64,
    pub lines_deleted: i64,
    pub size_delta: i64,
    /// Cached diff as returned by the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_type_from_gerrit_status() {
        assert_eq!(FileChangeType::from("A"), FileChangeType::Added);
        assert_eq!(FileChangeType::from("D"), FileChangeType::Deleted);
        assert_eq!(FileChangeType::from("R"), FileChangeType::Renamed);
        assert_eq!(FileChangeType::from("C"), FileChangeType::Copied);
        assert_eq!(FileChangeType::from("W"), FileChangeType::Rewritten);
        assert_eq!(FileChangeType::from("M"), FileChangeType::Modified);
    }
}
