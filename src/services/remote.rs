//! Remote review server seam.
//!
//! The sync engine and importer talk to the server only through
//! [`RemoteClient`]. Types here are transport-neutral: timestamps are Unix
//! seconds, account names are plain strings.

use crate::error::AppError;
use crate::models::{
    ChangeStatus, CommentRange, CommentSide, CommentSnapshot, Credentials, FileChangeType, FileEdit,
    Instance, PatchSetKind,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A change as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub change_id: String,
    pub number: i64,
    pub project: String,
    pub branch: String,
    pub subject: String,
    pub status: ChangeStatus,
    pub owner: String,
    pub current_revision: String,
    /// Last modification (Unix).
    pub updated: i64,
    pub topic: Option<String>,
    pub hashtags: Vec<String>,
    /// All patch sets, any order.
    pub patch_sets: Vec<RemotePatchSet>,
    /// The authenticated user's current votes.
    pub votes: BTreeMap<String, i32>,
}

impl RemoteChange {
    /// The patch set whose revision is `current_revision`, falling back to
    /// the highest number.
    pub fn current_patch_set(&self) -> Option<&RemotePatchSet> {
        self.patch_sets
            .iter()
            .find(|ps| ps.revision == self.current_revision)
            .or_else(|| self.patch_sets.iter().max_by_key(|ps| ps.number))
    }

    pub fn current_patch_set_number(&self) -> i64 {
        self.current_patch_set().map_or(0, |ps| ps.number)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePatchSet {
    pub number: i64,
    pub revision: String,
    pub author: String,
    pub kind: PatchSetKind,
    pub created: i64,
    pub files: Vec<RemoteFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub path: String,
    pub old_path: Option<String>,
    pub change_type: FileChangeType,
    pub lines_inserted: i64,
    pub lines_deleted: i64,
    pub size_delta: i64,
}

/// A published comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteComment {
    pub id: String,
    pub patch_set: i64,
    pub path: String,
    pub side: CommentSide,
    pub line: Option<i64>,
    pub range: Option<CommentRange>,
    pub message: String,
    pub author: String,
    pub unresolved: bool,
    pub in_reply_to: Option<String>,
    pub updated: i64,
}

impl RemoteComment {
    pub fn snapshot(&self) -> CommentSnapshot {
        CommentSnapshot {
            remote_id: self.id.clone(),
            patch_set: self.patch_set,
            file_path: self.path.clone(),
            side: self.side,
            line: self.line,
            range: self.range,
            message: self.message.clone(),
            author: self.author.clone(),
            unresolved: self.unresolved,
            updated: self.updated,
        }
    }
}

/// Comment content sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommentInput {
    pub path: String,
    pub side: CommentSide,
    pub line: Option<i64>,
    pub range: Option<CommentRange>,
    pub message: String,
    pub unresolved: bool,
    pub in_reply_to: Option<String>,
}

/// A review: cover message, votes and the comments published with it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReviewInput {
    pub message: Option<String>,
    pub labels: BTreeMap<String, i32>,
}

/// Outcome of posting a review. Labels the server refused are listed so
/// the caller can report a partial submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub applied_labels: BTreeMap<String, i32>,
    pub rejected_labels: Vec<String>,
}

impl ReviewResult {
    pub fn is_partial(&self) -> bool {
        !self.rejected_labels.is_empty()
    }
}

/// Search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChangeSummary {
    pub change_id: String,
    pub number: i64,
    pub project: String,
    pub branch: String,
    pub subject: String,
    pub status: ChangeStatus,
    pub owner: String,
    pub updated: i64,
}

/// Server API.
///
/// `change` arguments are remote change ids; `revision` is a commit SHA or
/// patch set number rendered as a string.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Server version string, e.g. `3.9.1`.
    async fn server_version(&self) -> Result<String, AppError>;

    async fn fetch_change(&self, change: &str) -> Result<RemoteChange, AppError>;

    async fn fetch_file_diff(&self, change: &str, revision: &str, path: &str) -> Result<String, AppError>;

    /// Published comments on every patch set.
    async fn fetch_comments(&self, change: &str) -> Result<Vec<RemoteComment>, AppError>;

    async fn post_comment(
        &self,
        change: &str,
        revision: &str,
        comment: &CommentInput,
    ) -> Result<RemoteComment, AppError>;

    async fn update_comment(
        &self,
        change: &str,
        revision: &str,
        remote_id: &str,
        comment: &CommentInput,
    ) -> Result<RemoteComment, AppError>;

    async fn delete_comment(&self, change: &str, revision: &str, remote_id: &str) -> Result<(), AppError>;

    async fn post_review(&self, change: &str, revision: &str, review: &ReviewInput) -> Result<ReviewResult, AppError>;

    /// Upload a new patch set made of `edits` on top of the current one.
    async fn push_patch_set(&self, change: &str, edits: &[FileEdit], message: &str) -> Result<RemotePatchSet, AppError>;

    async fn search_changes(&self, query: &str, limit: u32) -> Result<Vec<RemoteChangeSummary>, AppError>;
}

/// Builds a [`RemoteClient`] for an instance.
pub trait RemoteConnector: Send + Sync + fmt::Debug {
    fn connect(
        &self,
        instance: &Instance,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Arc<dyn RemoteClient>, AppError>;
}

/// Parse a `major.minor[.patch]` version, ignoring suffixes like `-rc1`.
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split(|c: char| c == '.' || c == '-');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("3.9.1"), Some((3, 9)));
        assert_eq!(parse_version("2.16"), Some((2, 16)));
        assert_eq!(parse_version("3.10.0-rc2"), Some((3, 10)));
        assert_eq!(parse_version("4"), Some((4, 0)));
        assert_eq!(parse_version("nightly"), None);
    }

    #[test]
    fn test_current_patch_set_follows_revision() {
        let ps = |number: i64, revision: &str| RemotePatchSet {
            number,
            revision: revision.into(),
            author: "bob".into(),
            kind: PatchSetKind::Rework,
            created: 0,
            files: Vec::new(),
        };
        let change = RemoteChange {
            change_id: "I1".into(),
            number: 1,
            project: "p".into(),
            branch: "main".into(),
            subject: "s".into(),
            status: ChangeStatus::New,
            owner: "bob".into(),
            current_revision: "b".into(),
            updated: 0,
            topic: None,
            hashtags: Vec::new(),
            patch_sets: vec![ps(1, "a"), ps(2, "b"), ps(3, "c")],
            votes: BTreeMap::new(),
        };
        assert_eq!(change.current_patch_set_number(), 2);
    }
}
