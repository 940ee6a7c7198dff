//! Conflict detection and resolution.
//!
//! [`reconcile`] compares a freshly pulled remote change against the local
//! copy, inside the caller's transaction, and records every divergence as a
//! [`Conflict`]. The requested strategy is applied straight away where it
//! can be; what remains open sets the change's `conflict_status`, which
//! keeps its queue entries out of every push until resolved.
//!
//! AutoMerge applies when the two sides do not overlap: comment line spans
//! on the same file and side are disjoint, or the two sides changed
//! disjoint fields of one comment (message vs unresolved flag), or each vote
//! label was changed by at most one side. Patch set conflicts are never
//! settled during a pull.

use crate::context::AppContext;
use crate::db::{changes, comments, conflicts, reviews};
use crate::error::AppError;
use crate::models::{
    Change, CommentSnapshot, CommentStatus, Conflict, ConflictDetail, ConflictKind, ConflictStatus,
    ContentFingerprint, ImportStatus, LineSpan, NewOperation, OperationPayload, OperationType,
    ResolutionStrategy, ReviewStatus,
};
use crate::services::importer::{self, MergedComments};
use crate::services::operation_queue::{self, QueuePolicy};
use crate::services::remote::{RemoteChange, RemoteComment};
use crate::services::sync_events::{ChangeUpdateType, SyncEvent};
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};

/// What one [`reconcile`] call did.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Conflicts recorded by this call, including those settled at once.
    pub detected: Vec<Conflict>,

    /// Conflicts still open on the change afterwards.
    pub open: Vec<Conflict>,

    pub auto_resolved: usize,

    pub updates: Vec<ChangeUpdateType>,

    pub conflict_status: ConflictStatus,
}

impl Reconciliation {
    fn touched(&mut self, update: ChangeUpdateType) {
        if !self.updates.contains(&update) {
            self.updates.push(update);
        }
    }
}

/// Reconcile the local copy of `change` with `remote`.
///
/// `remote_comments` is `None` when the run did not fetch comments.
pub(crate) async fn reconcile(
    conn: &mut SqliteConnection,
    change: &Change,
    remote: &RemoteChange,
    remote_comments: Option<&[RemoteComment]>,
    strategy: ResolutionStrategy,
    policy: &QueuePolicy,
    now: i64,
) -> Result<Reconciliation, AppError> {
    let mut out = Reconciliation::default();
    let has_pending = operation_queue::has_pending(conn, change.id).await?;

    changes::update_metadata(conn, change.id, &importer::metadata_of(remote), now).await?;
    if remote.subject != change.subject || Some(remote.updated) != change.remote_updated_at {
        out.touched(ChangeUpdateType::MetadataUpdated);
    }

    if remote.status != change.status {
        out.touched(ChangeUpdateType::StatusChanged);
        if change.status.is_open() && !remote.status.is_open() && has_pending {
            let detail = ConflictDetail::Status {
                local: change.status,
                remote: remote.status,
            };
            record(conn, change, detail, strategy, policy, now, &mut out).await?;
        }
    }

    let added = importer::sync_patch_sets(conn, change.id, remote).await?;
    if !added.is_empty() {
        out.touched(ChangeUpdateType::PatchSetAdded);
        if change.is_imported() {
            changes::set_import_status(conn, change.id, ImportStatus::Outdated, now).await?;
        }
        importer::store_patch_set_files(conn, change.id, remote, &added).await?;
        if has_pending {
            record_newer_patch_set(conn, change, remote, strategy, policy, now, &mut out).await?;
        }
    }

    if let Some(remote_comments) = remote_comments {
        let merged = importer::merge_remote_comments(conn, change.id, remote_comments, now).await?;
        if merged.changed_anything() {
            out.touched(ChangeUpdateType::CommentsUpdated);
        }
        detect_overlapping_comments(conn, change, &merged, strategy, policy, now, &mut out).await?;
        detect_remote_edits(conn, change, &merged, strategy, policy, now, &mut out).await?;
        drop_remotely_deleted(conn, change.id, &merged, now, &mut out).await?;
    }

    detect_vote_conflicts(conn, change, remote, strategy, policy, now, &mut out).await?;

    changes::recompute_totals(conn, change.id, now).await?;

    out.open = conflicts::open_for_change(conn, change.id).await?;
    out.conflict_status = refresh_conflict_status(conn, change.id, now).await?;
    Ok(out)
}

async fn record_newer_patch_set(
    conn: &mut SqliteConnection,
    change: &Change,
    remote: &RemoteChange,
    strategy: ResolutionStrategy,
    policy: &QueuePolicy,
    now: i64,
    out: &mut Reconciliation,
) -> Result<(), AppError> {
    if remote.current_patch_set_number() <= change.current_patch_set_num {
        return Ok(());
    }
    let detail = ConflictDetail::PatchSet {
        local_patch_set: change.current_patch_set_num,
        remote_patch_set: remote.current_patch_set_number(),
        remote_revision: remote.current_revision.clone(),
    };
    record(conn, change, detail, strategy, policy, now, out).await
}

/// Flag pending work on `previous` when `remote` moved past its patch set.
///
/// Re-imports advance the current patch set outside a pull, so they check
/// here before the next push can run.
pub(crate) async fn flag_newer_patch_set(
    conn: &mut SqliteConnection,
    previous: &Change,
    remote: &RemoteChange,
    policy: &QueuePolicy,
    now: i64,
) -> Result<ConflictStatus, AppError> {
    if operation_queue::has_pending(conn, previous.id).await? {
        let mut out = Reconciliation::default();
        record_newer_patch_set(conn, previous, remote, ResolutionStrategy::AutoMerge, policy, now, &mut out)
            .await?;
    }
    refresh_conflict_status(conn, previous.id, now).await
}

/// A new remote comment overlapping a pending local one with other text.
async fn detect_overlapping_comments(
    conn: &mut SqliteConnection,
    change: &Change,
    merged: &MergedComments,
    strategy: ResolutionStrategy,
    policy: &QueuePolicy,
    now: i64,
    out: &mut Reconciliation,
) -> Result<(), AppError> {
    if merged.inserted.is_empty() {
        return Ok(());
    }

    let pending: Vec<_> = comments::unsynced_for_change(conn, change.id)
        .await?
        .into_iter()
        .filter(|c| c.remote_id.is_none())
        .filter(|c| matches!(c.status, CommentStatus::LocalOnly | CommentStatus::SyncPending))
        .collect();

    for (row, rc) in &merged.inserted {
        let remote_span = LineSpan::new(rc.line, rc.range.as_ref());
        for local in &pending {
            let same_anchor = local.patch_set_id == row.patch_set_id
                && local.file_path == rc.path
                && local.side == rc.side;
            if !same_anchor || !local.span().overlaps(&remote_span) || local.message == rc.message {
                continue;
            }
            let detail = ConflictDetail::Comment {
                comment_id: local.id,
                remote: rc.snapshot(),
                new_remote: true,
            };
            record(conn, change, detail, strategy, policy, now, out).await?;
        }
    }
    Ok(())
}

/// Remote edits to comments we know, three-way against the base hash.
async fn detect_remote_edits(
    conn: &mut SqliteConnection,
    change: &Change,
    merged: &MergedComments,
    strategy: ResolutionStrategy,
    policy: &QueuePolicy,
    now: i64,
    out: &mut Reconciliation,
) -> Result<(), AppError> {
    for (local, rc) in &merged.known {
        if local.deleted {
            continue;
        }
        let remote_fp = ContentFingerprint::of(&rc.message, rc.unresolved);
        let base = local.base_fingerprint().unwrap_or_else(|| local.fingerprint());
        if remote_fp == base || remote_fp == local.fingerprint() {
            continue;
        }

        if local.status == CommentStatus::Synced {
            comments::overwrite_from_remote(conn, local.id, &rc.message, rc.unresolved, now).await?;
            out.touched(ChangeUpdateType::CommentsUpdated);
            continue;
        }

        let detail = ConflictDetail::Comment {
            comment_id: local.id,
            remote: rc.snapshot(),
            new_remote: false,
        };
        record(conn, change, detail, strategy, policy, now, out).await?;
    }
    Ok(())
}

/// Synced comments whose remote copy is gone are soft-deleted.
async fn drop_remotely_deleted(
    conn: &mut SqliteConnection,
    change_id: i64,
    merged: &MergedComments,
    now: i64,
    out: &mut Reconciliation,
) -> Result<(), AppError> {
    let seen: BTreeSet<&str> = merged.seen.iter().map(String::as_str).collect();
    for comment in comments::list_for_change(conn, change_id).await? {
        let Some(remote_id) = comment.remote_id.as_deref() else {
            continue;
        };
        if comment.deleted || comment.status != CommentStatus::Synced || seen.contains(remote_id) {
            continue;
        }
        log::debug!("Comment {} was deleted on the server", comment.id);
        comments::soft_delete(conn, comment.id, now).await?;
        out.touched(ChangeUpdateType::CommentsUpdated);
    }
    Ok(())
}

/// Labels changed by both sides to different values.
fn conflicting_labels(
    local: &BTreeMap<String, i32>,
    remote: &BTreeMap<String, i32>,
    baseline: &BTreeMap<String, i32>,
) -> Vec<String> {
    local
        .iter()
        .filter(|(label, value)| {
            let base = baseline.get(*label);
            let theirs = remote.get(*label);
            base != Some(*value) && theirs != base && theirs != Some(*value)
        })
        .map(|(label, _)| label.clone())
        .collect()
}

async fn detect_vote_conflicts(
    conn: &mut SqliteConnection,
    change: &Change,
    remote: &RemoteChange,
    strategy: ResolutionStrategy,
    policy: &QueuePolicy,
    now: i64,
    out: &mut Reconciliation,
) -> Result<(), AppError> {
    let baseline = &change.extensions.baseline_votes;
    if remote.votes != *baseline {
        for review in reviews::pending_for_change(conn, change.id).await? {
            if conflicting_labels(&review.labels, &remote.votes, baseline).is_empty() {
                continue;
            }
            let detail = ConflictDetail::ReviewState {
                review_id: review.id,
                local: review.labels.clone(),
                remote: remote.votes.clone(),
                baseline: baseline.clone(),
            };
            record(conn, change, detail, strategy, policy, now, out).await?;
        }
    }

    let review_conflict_open = conflicts::open_for_change(conn, change.id)
        .await?
        .iter()
        .any(|c| c.kind == ConflictKind::ReviewState);
    if !review_conflict_open {
        changes::set_baseline_votes(conn, change.id, &remote.votes).await?;
    }
    Ok(())
}

/// Record a detection, refreshing an open conflict on the same subject, and
/// apply `strategy` where it settles the conflict.
async fn record(
    conn: &mut SqliteConnection,
    change: &Change,
    detail: ConflictDetail,
    strategy: ResolutionStrategy,
    policy: &QueuePolicy,
    now: i64,
    out: &mut Reconciliation,
) -> Result<(), AppError> {
    let key = detail.subject_key();
    let existing = conflicts::open_for_change(conn, change.id)
        .await?
        .into_iter()
        .find(|c| c.detail.subject_key() == key);

    let conflict = match existing {
        Some(conflict) => {
            conflicts::update_detail(conn, conflict.id, &detail, now).await?;
            conflicts::require(conn, conflict.id).await?
        }
        None => {
            let conflict = conflicts::insert(conn, change.id, &detail, now).await?;
            log::info!(
                "Conflict #{} ({:?}) detected on change {}",
                conflict.id,
                conflict.kind,
                change.number
            );
            out.detected.push(conflict.clone());
            conflict
        }
    };

    if let ConflictDetail::Comment { comment_id, .. } = &conflict.detail {
        comments::set_status(conn, *comment_id, CommentStatus::ConflictDetected, now).await?;
    }

    match strategy {
        ResolutionStrategy::ManualResolutionRequired => {
            conflicts::set_requested_resolution(conn, conflict.id, strategy).await?;
        }
        _ if conflict.kind == ConflictKind::PatchSet => {}
        _ => {
            if apply(conn, change, &conflict, strategy, policy, now).await? {
                conflicts::resolve(conn, conflict.id, strategy, now).await?;
                out.auto_resolved += 1;
            }
        }
    }
    Ok(())
}

/// Recompute a change's `conflict_status` from its open conflicts.
pub(crate) async fn refresh_conflict_status(
    conn: &mut SqliteConnection,
    change_id: i64,
    now: i64,
) -> Result<ConflictStatus, AppError> {
    let status = conflicts::open_for_change(conn, change_id)
        .await?
        .iter()
        .map(status_of)
        .max()
        .unwrap_or(ConflictStatus::None);
    changes::set_conflict_status(conn, change_id, status, now).await?;
    Ok(status)
}

fn status_of(conflict: &Conflict) -> ConflictStatus {
    if conflict.resolution == Some(ResolutionStrategy::ManualResolutionRequired) {
        return ConflictStatus::ManualResolutionRequired;
    }
    match conflict.kind {
        ConflictKind::PatchSet => ConflictStatus::PatchSetUpdated,
        ConflictKind::Status => ConflictStatus::ManualResolutionRequired,
        ConflictKind::Comment | ConflictKind::ReviewState => ConflictStatus::CommentsPending,
    }
}

/// Apply `strategy` to an open conflict.
///
/// Returns `false` when AutoMerge finds both sides overlapping.
async fn apply(
    conn: &mut SqliteConnection,
    change: &Change,
    conflict: &Conflict,
    strategy: ResolutionStrategy,
    policy: &QueuePolicy,
    now: i64,
) -> Result<bool, AppError> {
    match &conflict.detail {
        ConflictDetail::Comment {
            comment_id,
            remote,
            new_remote: true,
        } => apply_new_remote_comment(conn, change, *comment_id, remote, strategy, now).await,
        ConflictDetail::Comment {
            comment_id,
            remote,
            new_remote: false,
        } => apply_remote_edit(conn, change, *comment_id, remote, strategy, policy, now).await,
        ConflictDetail::ReviewState {
            review_id,
            local,
            remote,
            baseline,
        } => {
            let conflicting = conflicting_labels(local, remote, baseline);
            match strategy {
                ResolutionStrategy::AutoMerge if !conflicting.is_empty() => return Ok(false),
                ResolutionStrategy::RemoteWins => {
                    if let Some(review) = reviews::get(conn, *review_id).await? {
                        let mut labels = review.labels.clone();
                        labels.retain(|label, _| !conflicting.contains(label));
                        reviews::set_labels(conn, review.id, &labels, now).await?;
                    }
                }
                _ => {}
            }
            changes::set_baseline_votes(conn, change.id, remote).await?;
            Ok(true)
        }
        ConflictDetail::PatchSet { .. } => {
            if strategy == ResolutionStrategy::RemoteWins {
                discard_pending_work(conn, change.id, now).await?;
            }
            Ok(true)
        }
        ConflictDetail::Status { .. } => match strategy {
            ResolutionStrategy::AutoMerge => Ok(false),
            ResolutionStrategy::RemoteWins => {
                discard_pending_work(conn, change.id, now).await?;
                Ok(true)
            }
            _ => Ok(true),
        },
    }
}

/// Status a comment returns to once its conflict is settled in its favour.
fn pending_status(has_remote_id: bool) -> CommentStatus {
    if has_remote_id {
        CommentStatus::ModifiedLocally
    } else {
        CommentStatus::LocalOnly
    }
}

async fn apply_new_remote_comment(
    conn: &mut SqliteConnection,
    change: &Change,
    comment_id: i64,
    remote: &CommentSnapshot,
    strategy: ResolutionStrategy,
    now: i64,
) -> Result<bool, AppError> {
    let Some(local) = comments::get(conn, comment_id).await?.filter(|c| !c.deleted) else {
        return Ok(true);
    };

    match strategy {
        ResolutionStrategy::AutoMerge => {
            let remote_span = LineSpan::new(remote.line, remote.range.as_ref());
            if local.span().overlaps(&remote_span) && local.message != remote.message {
                return Ok(false);
            }
            comments::set_status(conn, local.id, pending_status(local.remote_id.is_some()), now).await?;
        }
        ResolutionStrategy::RemoteWins => {
            operation_queue::cancel_for_change(conn, change.id, Some(local.id), now).await?;
            comments::set_status(conn, local.id, CommentStatus::SyncFailed, now).await?;
        }
        _ => {
            comments::set_status(conn, local.id, pending_status(local.remote_id.is_some()), now).await?;
        }
    }
    Ok(true)
}

async fn apply_remote_edit(
    conn: &mut SqliteConnection,
    change: &Change,
    comment_id: i64,
    remote: &CommentSnapshot,
    strategy: ResolutionStrategy,
    policy: &QueuePolicy,
    now: i64,
) -> Result<bool, AppError> {
    let Some(local) = comments::get(conn, comment_id).await?.filter(|c| !c.deleted) else {
        return Ok(true);
    };
    let remote_fp = ContentFingerprint::of(&remote.message, remote.unresolved);
    let local_fp = local.fingerprint();
    let base = local.base_fingerprint().unwrap_or_else(|| remote_fp.clone());

    let (message, unresolved) = match strategy {
        ResolutionStrategy::RemoteWins => {
            operation_queue::cancel_for_change(conn, change.id, Some(local.id), now).await?;
            comments::overwrite_from_remote(conn, local.id, &remote.message, remote.unresolved, now).await?;
            return Ok(true);
        }
        ResolutionStrategy::AutoMerge => {
            let ours = local_fp.changed_fields(&base);
            let theirs = remote_fp.changed_fields(&base);
            if !ours.is_disjoint(&theirs) {
                return Ok(false);
            }
            let message = if ours.message { &local.message } else { &remote.message };
            let unresolved = if ours.unresolved { local.unresolved } else { remote.unresolved };
            (message.clone(), unresolved)
        }
        _ => (local.message.clone(), local.unresolved),
    };

    if ContentFingerprint::of(&message, unresolved) == remote_fp {
        operation_queue::cancel_for_change(conn, change.id, Some(local.id), now).await?;
        comments::overwrite_from_remote(conn, local.id, &remote.message, remote.unresolved, now).await?;
        return Ok(true);
    }

    comments::update_content(conn, local.id, &message, unresolved, CommentStatus::ModifiedLocally, now).await?;
    comments::set_base_hash(conn, local.id, &remote_fp.encode()).await?;

    let queued = operation_queue::pending_for_comment(conn, local.id)
        .await?
        .iter()
        .any(|e| e.operation_type == OperationType::UpdateComment);
    if !queued {
        let op = NewOperation::new(change.id, OperationPayload::UpdateComment { comment_id: local.id });
        operation_queue::enqueue(conn, &op, policy, now).await?;
    }
    Ok(true)
}

/// Cancel a change's queue entries and mark its unsent work failed. Nothing
/// is deleted, so the user can still copy it out.
async fn discard_pending_work(conn: &mut SqliteConnection, change_id: i64, now: i64) -> Result<(), AppError> {
    let cancelled = operation_queue::cancel_for_change(conn, change_id, None, now).await?;
    comments::fail_unsynced(conn, change_id, now).await?;
    for review in reviews::pending_for_change(conn, change_id).await? {
        reviews::set_status(conn, review.id, ReviewStatus::SubmissionFailed, now).await?;
    }
    log::info!("Discarded {} pending operation(s) of change {}", cancelled, change_id);
    Ok(())
}

/// Settle an open conflict with `strategy`.
///
/// `ManualResolutionRequired` only records the request and keeps the change
/// blocked. AutoMerge on overlapping edits is refused with a validation
/// error and leaves the conflict open.
pub async fn resolve_conflict(
    ctx: &AppContext,
    conflict_id: i64,
    strategy: ResolutionStrategy,
) -> Result<Conflict, AppError> {
    let policy = ctx.settings().queue;
    let now = ctx.now();

    let (conflict, change) = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                let conflict = conflicts::require(conn, conflict_id).await?;
                if !conflict.is_open() {
                    return Err(AppError::validation(format!("Conflict {} is already resolved", conflict_id)));
                }
                let change = changes::require(conn, conflict.change_id).await?;

                if strategy == ResolutionStrategy::ManualResolutionRequired {
                    conflicts::set_requested_resolution(conn, conflict.id, strategy).await?;
                } else {
                    if !apply(conn, &change, &conflict, strategy, &policy, now).await? {
                        return Err(AppError::validation(
                            "Both sides changed the same content; choose LocalWins or RemoteWins",
                        ));
                    }
                    conflicts::resolve(conn, conflict.id, strategy, now).await?;
                }
                refresh_conflict_status(conn, change.id, now).await?;
                Ok((conflicts::require(conn, conflict.id).await?, change))
            })
        })
        .await?;

    log::info!("Conflict #{} on change {} settled with {}", conflict.id, change.number, strategy);
    ctx.events.emit(SyncEvent::ChangeUpdated {
        change_id: change.id,
        instance_id: change.instance_id,
        update_type: ChangeUpdateType::MetadataUpdated,
    });
    Ok(conflict)
}
