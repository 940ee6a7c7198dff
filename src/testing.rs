//! In-memory test doubles for the collaborator traits.
//!
//! [`FakeRemote`] keeps a server's worth of changes and comments in memory
//! and can be told to fail, hang or slow down per method. Used by the crate's
//! own tests and available to embedders through the `test-util` feature.

use crate::clock::{Clock, SystemClock};
use crate::error::AppError;
use crate::models::{
    ChangeStatus, CommentSide, Credentials, FileChangeType, FileEdit, Instance, PatchSetKind,
};
use crate::services::credentials::CredentialVault;
use crate::services::remote::{
    CommentInput, RemoteChange, RemoteChangeSummary, RemoteClient, RemoteComment, RemoteConnector,
    RemoteFile, RemotePatchSet, ReviewInput, ReviewResult,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SEAL_PREFIX: &[u8] = b"sealed:";

/// Vault that only tags plaintext. Never use outside tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughVault;

impl CredentialVault for PassthroughVault {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AppError> {
        let mut out = SEAL_PREFIX.to_vec();
        out.extend_from_slice(plaintext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, AppError> {
        ciphertext
            .strip_prefix(SEAL_PREFIX)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| AppError::vault("Ciphertext was not sealed by this vault"))
    }
}

/// Failure a [`FakeRemote`] method can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    Timeout,
    Network,
    Unauthorized,
    NotFound,
    /// HTTP error with the given status.
    Status(u16),
    /// Never complete.
    Hang,
}

impl FakeFailure {
    fn into_error(self, method: &str) -> AppError {
        match self {
            Self::Timeout => AppError::timeout(format!("{} timed out", method)),
            Self::Network => AppError::network("Connection refused"),
            Self::Unauthorized => AppError::authentication("Credentials rejected"),
            Self::NotFound => AppError::remote_api_full("Resource not found", 404, method),
            Self::Status(code) => AppError::remote_api_full(format!("Request failed ({})", code), code, method),
            Self::Hang => AppError::internal(format!("{} never answered", method)),
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    version: String,
    changes: HashMap<String, RemoteChange>,
    comments: HashMap<String, Vec<RemoteComment>>,
    diffs: HashMap<(String, String), String>,
    reviews: HashMap<String, Vec<ReviewInput>>,
    rejected_labels: HashSet<String>,
    queued_failures: HashMap<String, VecDeque<FakeFailure>>,
    persistent_failures: HashMap<String, FakeFailure>,
    latency: Option<Duration>,
    calls: Vec<String>,
    next_comment: u64,
}

/// In-memory review server.
#[derive(Debug)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
    clock: Arc<dyn Clock>,
    user: String,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Stamp remote modifications with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                version: "3.9.1".to_string(),
                ..Default::default()
            }),
            clock,
            user: "me".to_string(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Account name used for comments this remote creates on our behalf.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn set_version(&self, version: &str) {
        self.lock().version = version.to_string();
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Fail the next `times` calls of `method`.
    pub fn fail_times(&self, method: &str, failure: FakeFailure, times: usize) {
        let mut state = self.lock();
        let queue = state.queued_failures.entry(method.to_string()).or_default();
        queue.extend(std::iter::repeat(failure).take(times));
    }

    pub fn fail_next(&self, method: &str, failure: FakeFailure) {
        self.fail_times(method, failure, 1);
    }

    /// Fail every call of `method` until cleared.
    pub fn fail_always(&self, method: &str, failure: FakeFailure) {
        self.lock().persistent_failures.insert(method.to_string(), failure);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.queued_failures.clear();
        state.persistent_failures.clear();
    }

    /// Method names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.as_str() == method).count()
    }

    pub fn add_change(&self, change: RemoteChange) {
        let mut state = self.lock();
        state.comments.entry(change.change_id.clone()).or_default();
        state.changes.insert(change.change_id.clone(), change);
    }

    pub fn change(&self, change_id: &str) -> Option<RemoteChange> {
        self.lock().changes.get(change_id).cloned()
    }

    pub fn comments(&self, change_id: &str) -> Vec<RemoteComment> {
        self.lock().comments.get(change_id).cloned().unwrap_or_default()
    }

    pub fn reviews(&self, change_id: &str) -> Vec<ReviewInput> {
        self.lock().reviews.get(change_id).cloned().unwrap_or_default()
    }

    /// Labels `post_review` will refuse to apply.
    pub fn reject_labels(&self, labels: &[&str]) {
        self.lock().rejected_labels = labels.iter().map(|l| l.to_string()).collect();
    }

    pub fn set_diff(&self, revision: &str, path: &str, diff: &str) {
        self.lock()
            .diffs
            .insert((revision.to_string(), path.to_string()), diff.to_string());
    }

    /// Upload a new patch set touching `files`. Returns its number.
    pub fn add_patch_set(&self, change_id: &str, files: &[&str]) -> i64 {
        let now = self.clock.unix();
        let mut state = self.lock();
        let Some(change) = state.changes.get_mut(change_id) else {
            return 0;
        };
        let number = change.patch_sets.iter().map(|ps| ps.number).max().unwrap_or(0) + 1;
        let patch_set = patch_set(change_id, number, files, now);
        change.current_revision = patch_set.revision.clone();
        change.patch_sets.push(patch_set);
        change.updated = now;
        number
    }

    pub fn set_status(&self, change_id: &str, status: ChangeStatus) {
        let now = self.clock.unix();
        if let Some(change) = self.lock().changes.get_mut(change_id) {
            change.status = status;
            change.updated = now;
        }
    }

    /// Set our vote as seen by the server (e.g. cast from another client).
    pub fn set_vote(&self, change_id: &str, label: &str, value: i32) {
        let now = self.clock.unix();
        if let Some(change) = self.lock().changes.get_mut(change_id) {
            if value == 0 {
                change.votes.remove(label);
            } else {
                change.votes.insert(label.to_string(), value);
            }
            change.updated = now;
        }
    }

    /// Publish a comment as another user.
    pub fn add_comment(&self, change_id: &str, mut comment: RemoteComment) -> RemoteComment {
        let now = self.clock.unix();
        comment.updated = now;
        let mut state = self.lock();
        if let Some(change) = state.changes.get_mut(change_id) {
            change.updated = now;
        }
        state
            .comments
            .entry(change_id.to_string())
            .or_default()
            .push(comment.clone());
        comment
    }

    /// Edit a published comment as if from another client.
    pub fn edit_comment(&self, change_id: &str, remote_id: &str, message: Option<&str>, unresolved: Option<bool>) {
        let now = self.clock.unix();
        let mut state = self.lock();
        if let Some(comment) = state
            .comments
            .get_mut(change_id)
            .and_then(|list| list.iter_mut().find(|c| c.id == remote_id))
        {
            if let Some(message) = message {
                comment.message = message.to_string();
            }
            if let Some(unresolved) = unresolved {
                comment.unresolved = unresolved;
            }
            comment.updated = now;
        }
        if let Some(change) = state.changes.get_mut(change_id) {
            change.updated = now;
        }
    }

    /// Record the call and apply latency or an injected failure.
    async fn enter(&self, method: &str) -> Result<(), AppError> {
        let (latency, failure) = {
            let mut state = self.lock();
            state.calls.push(method.to_string());
            let queued = state
                .queued_failures
                .get_mut(method)
                .and_then(VecDeque::pop_front);
            let failure = queued.or_else(|| state.persistent_failures.get(method).copied());
            (state.latency, failure)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(FakeFailure::Hang) => std::future::pending::<Result<(), AppError>>().await,
            Some(failure) => Err(failure.into_error(method)),
            None => Ok(()),
        }
    }

    fn patch_set_number(change: &RemoteChange, revision: &str) -> i64 {
        change
            .patch_sets
            .iter()
            .find(|ps| ps.revision == revision || ps.number.to_string() == revision)
            .map_or_else(|| change.current_patch_set_number(), |ps| ps.number)
    }
}

/// A remote change with one patch set touching `files`.
pub fn remote_change(change_id: &str, number: i64, files: &[&str]) -> RemoteChange {
    let first = patch_set(change_id, 1, files, 0);
    RemoteChange {
        change_id: change_id.to_string(),
        number,
        project: "platform/core".to_string(),
        branch: "main".to_string(),
        subject: format!("Change {}", number),
        status: ChangeStatus::New,
        owner: "bob".to_string(),
        current_revision: first.revision.clone(),
        updated: 0,
        topic: None,
        hashtags: Vec::new(),
        patch_sets: vec![first],
        votes: BTreeMap::new(),
    }
}

/// A published comment by another reviewer.
pub fn remote_comment(id: &str, patch_set: i64, path: &str, line: Option<i64>, message: &str) -> RemoteComment {
    RemoteComment {
        id: id.to_string(),
        patch_set,
        path: path.to_string(),
        side: CommentSide::Revision,
        line,
        range: None,
        message: message.to_string(),
        author: "carol".to_string(),
        unresolved: true,
        in_reply_to: None,
        updated: 0,
    }
}

fn patch_set(change_id: &str, number: i64, files: &[&str], created: i64) -> RemotePatchSet {
    RemotePatchSet {
        number,
        revision: format!("{}-rev{}", change_id, number),
        author: "bob".to_string(),
        kind: PatchSetKind::Rework,
        created,
        files: files
            .iter()
            .map(|path| RemoteFile {
                path: path.to_string(),
                old_path: None,
                change_type: FileChangeType::Modified,
                lines_inserted: 1,
                lines_deleted: 0,
                size_delta: 10,
            })
            .collect(),
    }
}

fn not_found(what: &str) -> AppError {
    AppError::remote_api_full("Resource not found", 404, what)
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn server_version(&self) -> Result<String, AppError> {
        self.enter("server_version").await?;
        Ok(self.lock().version.clone())
    }

    async fn fetch_change(&self, change: &str) -> Result<RemoteChange, AppError> {
        self.enter("fetch_change").await?;
        self.lock()
            .changes
            .get(change)
            .cloned()
            .ok_or_else(|| AppError::change_not_found(change))
    }

    async fn fetch_file_diff(&self, change: &str, revision: &str, path: &str) -> Result<String, AppError> {
        self.enter("fetch_file_diff").await?;
        let state = self.lock();
        if !state.changes.contains_key(change) {
            return Err(AppError::change_not_found(change));
        }
        Ok(state
            .diffs
            .get(&(revision.to_string(), path.to_string()))
            .cloned()
            .unwrap_or_else(|| format!("+{}\n", path)))
    }

    async fn fetch_comments(&self, change: &str) -> Result<Vec<RemoteComment>, AppError> {
        self.enter("fetch_comments").await?;
        let state = self.lock();
        if !state.changes.contains_key(change) {
            return Err(AppError::change_not_found(change));
        }
        Ok(state.comments.get(change).cloned().unwrap_or_default())
    }

    async fn post_comment(
        &self,
        change: &str,
        revision: &str,
        comment: &CommentInput,
    ) -> Result<RemoteComment, AppError> {
        self.enter("post_comment").await?;
        let now = self.clock.unix();
        let mut state = self.lock();
        state.next_comment += 1;
        let id = format!("remote-{}", state.next_comment);

        let remote_change = state.changes.get_mut(change).ok_or_else(|| AppError::change_not_found(change))?;
        let patch_set = Self::patch_set_number(remote_change, revision);
        remote_change.updated = now;

        let posted = RemoteComment {
            id,
            patch_set,
            path: comment.path.clone(),
            side: comment.side,
            line: comment.line,
            range: comment.range,
            message: comment.message.clone(),
            author: self.user.clone(),
            unresolved: comment.unresolved,
            in_reply_to: comment.in_reply_to.clone(),
            updated: now,
        };
        state
            .comments
            .entry(change.to_string())
            .or_default()
            .push(posted.clone());
        Ok(posted)
    }

    async fn update_comment(
        &self,
        change: &str,
        _revision: &str,
        remote_id: &str,
        comment: &CommentInput,
    ) -> Result<RemoteComment, AppError> {
        self.enter("update_comment").await?;
        let now = self.clock.unix();
        let mut state = self.lock();
        let existing = state
            .comments
            .get_mut(change)
            .and_then(|list| list.iter_mut().find(|c| c.id == remote_id))
            .ok_or_else(|| not_found("update_comment"))?;
        existing.message = comment.message.clone();
        existing.unresolved = comment.unresolved;
        existing.updated = now;
        let updated = existing.clone();
        if let Some(remote_change) = state.changes.get_mut(change) {
            remote_change.updated = now;
        }
        Ok(updated)
    }

    async fn delete_comment(&self, change: &str, _revision: &str, remote_id: &str) -> Result<(), AppError> {
        self.enter("delete_comment").await?;
        let mut state = self.lock();
        let list = state.comments.get_mut(change).ok_or_else(|| not_found("delete_comment"))?;
        let before = list.len();
        list.retain(|c| c.id != remote_id);
        if list.len() == before {
            return Err(not_found("delete_comment"));
        }
        Ok(())
    }

    async fn post_review(&self, change: &str, _revision: &str, review: &ReviewInput) -> Result<ReviewResult, AppError> {
        self.enter("post_review").await?;
        let now = self.clock.unix();
        let mut state = self.lock();
        let rejected = state.rejected_labels.clone();

        let remote_change = state.changes.get_mut(change).ok_or_else(|| AppError::change_not_found(change))?;
        let mut result = ReviewResult::default();
        for (label, value) in &review.labels {
            if rejected.contains(label) {
                result.rejected_labels.push(label.clone());
                continue;
            }
            if *value == 0 {
                remote_change.votes.remove(label);
            } else {
                remote_change.votes.insert(label.clone(), *value);
            }
            result.applied_labels.insert(label.clone(), *value);
        }
        remote_change.updated = now;

        state
            .reviews
            .entry(change.to_string())
            .or_default()
            .push(review.clone());
        Ok(result)
    }

    async fn push_patch_set(&self, change: &str, edits: &[FileEdit], _message: &str) -> Result<RemotePatchSet, AppError> {
        self.enter("push_patch_set").await?;
        let now = self.clock.unix();
        let mut state = self.lock();
        let remote_change = state.changes.get_mut(change).ok_or_else(|| AppError::change_not_found(change))?;

        let number = remote_change.current_patch_set_number() + 1;
        let mut new = patch_set(change, number, &[], now);
        new.author = self.user.clone();
        new.files = edits
            .iter()
            .map(|edit| RemoteFile {
                path: edit.path.clone(),
                old_path: None,
                change_type: if edit.content.is_some() {
                    FileChangeType::Modified
                } else {
                    FileChangeType::Deleted
                },
                lines_inserted: edit.content.as_ref().map_or(0, |c| c.lines().count() as i64),
                lines_deleted: 0,
                size_delta: edit.content.as_ref().map_or(0, |c| c.len() as i64),
            })
            .collect();

        remote_change.current_revision = new.revision.clone();
        remote_change.patch_sets.push(new.clone());
        remote_change.updated = now;
        Ok(new)
    }

    async fn search_changes(&self, query: &str, limit: u32) -> Result<Vec<RemoteChangeSummary>, AppError> {
        self.enter("search_changes").await?;
        let state = self.lock();
        let needle = query.to_lowercase();
        let mut hits: Vec<RemoteChangeSummary> = state
            .changes
            .values()
            .filter(|c| needle.is_empty() || c.subject.to_lowercase().contains(&needle))
            .map(|c| RemoteChangeSummary {
                change_id: c.change_id.clone(),
                number: c.number,
                project: c.project.clone(),
                branch: c.branch.clone(),
                subject: c.subject.clone(),
                status: c.status,
                owner: c.owner.clone(),
                updated: c.updated,
            })
            .collect();
        hits.sort_by(|a, b| b.number.cmp(&a.number));
        hits.truncate(limit as usize);
        Ok(hits)
    }
}

/// Connector handing out one shared [`FakeRemote`].
#[derive(Debug)]
pub struct FakeConnector {
    remote: Arc<FakeRemote>,
    connections: Mutex<Vec<(i64, String)>>,
}

impl FakeConnector {
    pub fn new(remote: Arc<FakeRemote>) -> Arc<Self> {
        Arc::new(Self {
            remote,
            connections: Mutex::new(Vec::new()),
        })
    }

    /// `(instance_id, username)` of every connection made.
    pub fn connections(&self) -> Vec<(i64, String)> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl RemoteConnector for FakeConnector {
    fn connect(
        &self,
        instance: &Instance,
        credentials: Credentials,
        _timeout: Duration,
    ) -> Result<Arc<dyn RemoteClient>, AppError> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((instance.id, credentials.username));
        Ok(self.remote.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let remote = FakeRemote::new();
        remote.add_change(remote_change("I1", 1, &["a.txt"]));
        remote.fail_times("fetch_change", FakeFailure::Status(503), 2);

        assert!(remote.fetch_change("I1").await.unwrap_err().is_transient());
        assert!(remote.fetch_change("I1").await.is_err());
        assert!(remote.fetch_change("I1").await.is_ok());
        assert_eq!(remote.call_count("fetch_change"), 3);
    }

    #[tokio::test]
    async fn test_rejected_labels_are_reported() {
        let remote = FakeRemote::new();
        remote.add_change(remote_change("I1", 1, &["a.txt"]));
        remote.reject_labels(&["Verified"]);

        let mut labels = BTreeMap::new();
        labels.insert("Code-Review".to_string(), 2);
        labels.insert("Verified".to_string(), 1);
        let result = remote
            .post_review("I1", "1", &ReviewInput { message: None, labels })
            .await
            .unwrap();

        assert!(result.is_partial());
        assert_eq!(remote.change("I1").unwrap().votes.get("Code-Review"), Some(&2));
        assert!(!remote.change("I1").unwrap().votes.contains_key("Verified"));
    }

    #[test]
    fn test_passthrough_vault_rejects_foreign_ciphertext() {
        let vault = PassthroughVault;
        let sealed = vault.encrypt(b"abc").unwrap();
        assert_eq!(vault.decrypt(&sealed).unwrap(), b"abc");
        assert!(vault.decrypt(b"abc").is_err());
    }
}
