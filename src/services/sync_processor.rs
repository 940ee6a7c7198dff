//! Sync processor for pushing queued local operations to the server.
//!
//! Takes entries from the operation queue and executes them against the
//! remote API. Every call runs under the request timeout and the run's
//! cancellation token. The queue is only advanced on a confirmed answer:
//! a cancelled or unauthenticated attempt is released untouched.

use crate::context::AppContext;
use crate::db::{changes, comments, files, patch_sets, reviews};
use crate::error::AppError;
use crate::models::{
    Change, CommentStatus, FileEdit, OperationPayload, OperationQueueEntry, OperationStatus, OperationType,
    ReviewStatus,
};
use crate::services::operation_queue::{self, BatchScope};
use crate::services::remote::{CommentInput, RemotePatchSet, RemoteClient, ReviewInput, ReviewResult};
use crate::services::sync_events::SyncEvent;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How an entry ended up after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Completed,
    /// Failed transiently; queued again with backoff.
    WillRetry { error: String },
    /// Failed terminally; surfaced to the user.
    Failed { error: String },
    /// Claimed by someone else between batch selection and processing.
    Skipped,
}

/// Result of processing a single entry.
#[derive(Debug)]
pub struct ProcessResult {
    pub entry_id: i64,
    pub change_id: i64,
    pub operation_type: OperationType,
    pub outcome: EntryOutcome,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.outcome == EntryOutcome::Completed
    }
}

/// What the server confirmed, applied locally on success.
#[derive(Debug)]
enum Applied {
    CommentPosted {
        comment_id: i64,
        remote_id: String,
        sent_hash: String,
    },
    CommentUpdated {
        comment_id: i64,
        sent_hash: String,
    },
    CommentDeleted {
        comment_id: i64,
    },
    ReviewPosted {
        review_id: i64,
        result: ReviewResult,
        missing_comments: bool,
    },
    PatchSetPushed(RemotePatchSet),
    Nothing,
}

/// Run a remote call under the request timeout, aborting on cancellation.
pub(crate) async fn guarded<T>(
    token: &CancellationToken,
    timeout: Duration,
    call: impl Future<Output = Result<T, AppError>>,
) -> Result<T, AppError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AppError::Cancelled),
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(result) => result,
            Err(_) => Err(AppError::timeout(format!("No answer within {}s", timeout.as_secs()))),
        },
    }
}

/// Process a single queue entry.
///
/// Returns `Err` only for failures that end the whole run (cancellation,
/// rejected credentials, local storage errors); the entry has then been
/// released for a later run.
pub async fn process_entry(
    ctx: &AppContext,
    client: &dyn RemoteClient,
    change: &Change,
    entry: &OperationQueueEntry,
    token: &CancellationToken,
) -> Result<ProcessResult, AppError> {
    let policy = ctx.settings().queue;
    let timeout = ctx.settings().request_timeout();
    let result = |outcome| ProcessResult {
        entry_id: entry.id,
        change_id: entry.change_id,
        operation_type: entry.operation_type,
        outcome,
    };

    {
        let mut conn = ctx.store.acquire().await?;
        if !operation_queue::mark_processing(&mut conn, entry.id, ctx.now()).await? {
            return Ok(result(EntryOutcome::Skipped));
        }
        if let OperationPayload::AddComment { comment_id } = &entry.payload {
            comments::set_status(&mut conn, *comment_id, CommentStatus::SyncPending, ctx.now()).await?;
        }
    }

    let attempt = match &entry.payload {
        OperationPayload::AddComment { comment_id } => {
            process_add_comment(ctx, client, change, *comment_id, token, timeout).await
        }
        OperationPayload::UpdateComment { comment_id } => {
            process_update_comment(ctx, client, change, *comment_id, token, timeout).await
        }
        OperationPayload::DeleteComment { comment_id, remote_id } => {
            process_delete_comment(ctx, client, change, *comment_id, remote_id, token, timeout).await
        }
        OperationPayload::SubmitReview { review_id } => {
            process_review(ctx, client, change, *review_id, true, token, timeout).await
        }
        OperationPayload::UpdateLabels { review_id } => {
            process_review(ctx, client, change, *review_id, false, token, timeout).await
        }
        OperationPayload::PushPatchSet { edits, message } => {
            process_push(client, change, edits, message, token, timeout).await
        }
    };

    match attempt {
        Ok(applied) => {
            let entry_id = entry.id;
            let change_id = change.id;
            let now = ctx.now();
            ctx.store
                .transaction(move |conn| {
                    Box::pin(async move {
                        operation_queue::mark_completed(conn, entry_id, now).await?;
                        apply_success(conn, change_id, applied, now).await
                    })
                })
                .await?;
            log::info!("Operation #{} ({}) synced", entry.id, entry.operation_type);
            emit(ctx, entry, true, None);
            Ok(result(EntryOutcome::Completed))
        }
        Err(e) if e.aborts_run() => {
            let mut conn = ctx.store.acquire().await?;
            operation_queue::release(&mut conn, entry.id, ctx.now()).await?;
            log::info!("Operation #{} released: {}", entry.id, e);
            Err(e)
        }
        Err(e) => {
            let message = e.to_string();
            let retryable = e.is_transient();
            let payload = entry.payload.clone();
            let entry_id = entry.id;
            let now = ctx.now();
            let error = message.clone();
            let status = ctx
                .store
                .transaction(move |conn| {
                    Box::pin(async move {
                        let status =
                            operation_queue::mark_failed(conn, entry_id, &error, retryable, &policy, now).await?;
                        if status == OperationStatus::Failed {
                            apply_failure(conn, &payload, now).await?;
                        }
                        Ok(status)
                    })
                })
                .await?;
            emit(ctx, entry, false, Some(message.clone()));
            if status == OperationStatus::Failed {
                Ok(result(EntryOutcome::Failed { error: message }))
            } else {
                Ok(result(EntryOutcome::WillRetry { error: message }))
            }
        }
    }
}

fn emit(ctx: &AppContext, entry: &OperationQueueEntry, success: bool, error: Option<String>) {
    ctx.events.emit(SyncEvent::OperationSynced {
        operation_id: entry.id,
        operation_type: entry.operation_type,
        change_id: entry.change_id,
        success,
        error,
    });
}

async fn revision_of(ctx: &AppContext, patch_set_id: i64) -> Result<String, AppError> {
    let mut conn = ctx.store.acquire().await?;
    Ok(patch_sets::require(&mut conn, patch_set_id).await?.revision)
}

/// Post a new comment.
async fn process_add_comment(
    ctx: &AppContext,
    client: &dyn RemoteClient,
    change: &Change,
    comment_id: i64,
    token: &CancellationToken,
    timeout: Duration,
) -> Result<Applied, AppError> {
    let (comment, in_reply_to) = {
        let mut conn = ctx.store.acquire().await?;
        let Some(comment) = comments::get(&mut conn, comment_id).await? else {
            return Ok(Applied::Nothing);
        };
        let parent = match comment.parent_id {
            Some(parent_id) => Some(comments::require(&mut conn, parent_id).await?),
            None => None,
        };
        let in_reply_to = match parent {
            Some(parent) => Some(
                parent
                    .remote_id
                    .ok_or_else(|| AppError::validation("Parent comment has not reached the server"))?,
            ),
            None => None,
        };
        (comment, in_reply_to)
    };
    if comment.deleted {
        return Ok(Applied::Nothing);
    }

    let revision = revision_of(ctx, comment.patch_set_id).await?;
    let input = CommentInput {
        path: comment.file_path.clone(),
        side: comment.side,
        line: comment.line,
        range: comment.range(),
        message: comment.message.clone(),
        unresolved: comment.unresolved,
        in_reply_to,
    };
    let posted = guarded(token, timeout, client.post_comment(&change.remote_change_id, &revision, &input)).await?;

    Ok(Applied::CommentPosted {
        comment_id,
        remote_id: posted.id,
        sent_hash: comment.content_hash,
    })
}

/// Replace the content of a published comment.
async fn process_update_comment(
    ctx: &AppContext,
    client: &dyn RemoteClient,
    change: &Change,
    comment_id: i64,
    token: &CancellationToken,
    timeout: Duration,
) -> Result<Applied, AppError> {
    let comment = {
        let mut conn = ctx.store.acquire().await?;
        comments::require(&mut conn, comment_id).await?
    };
    if comment.deleted {
        return Ok(Applied::Nothing);
    }
    let remote_id = comment
        .remote_id
        .clone()
        .ok_or_else(|| AppError::validation("Comment has no server copy to update"))?;

    let revision = revision_of(ctx, comment.patch_set_id).await?;
    let input = CommentInput {
        path: comment.file_path.clone(),
        side: comment.side,
        line: comment.line,
        range: comment.range(),
        message: comment.message.clone(),
        unresolved: comment.unresolved,
        in_reply_to: None,
    };
    guarded(
        token,
        timeout,
        client.update_comment(&change.remote_change_id, &revision, &remote_id, &input),
    )
    .await?;

    Ok(Applied::CommentUpdated {
        comment_id,
        sent_hash: comment.content_hash,
    })
}

/// Delete a published comment. A comment already gone counts as deleted.
async fn process_delete_comment(
    ctx: &AppContext,
    client: &dyn RemoteClient,
    change: &Change,
    comment_id: i64,
    remote_id: &str,
    token: &CancellationToken,
    timeout: Duration,
) -> Result<Applied, AppError> {
    let revision = {
        let mut conn = ctx.store.acquire().await?;
        match comments::get(&mut conn, comment_id).await? {
            Some(comment) => patch_sets::require(&mut conn, comment.patch_set_id).await?.revision,
            None => change.current_revision.clone(),
        }
    };

    match guarded(
        token,
        timeout,
        client.delete_comment(&change.remote_change_id, &revision, remote_id),
    )
    .await
    {
        Ok(()) => {}
        Err(e) if e.is_remote_not_found() => {
            log::debug!("Comment {} was already gone on the server", remote_id);
        }
        Err(e) => return Err(e),
    }
    Ok(Applied::CommentDeleted { comment_id })
}

/// Post a review (cover message, votes) or votes alone.
async fn process_review(
    ctx: &AppContext,
    client: &dyn RemoteClient,
    change: &Change,
    review_id: i64,
    with_message: bool,
    token: &CancellationToken,
    timeout: Duration,
) -> Result<Applied, AppError> {
    let (review, revision, missing_comments) = {
        let mut conn = ctx.store.acquire().await?;
        let review = reviews::require(&mut conn, review_id).await?;
        let revision = patch_sets::require(&mut conn, review.patch_set_id).await?.revision;
        let mut missing = false;
        for comment_id in &review.comment_ids {
            let synced = comments::get(&mut conn, *comment_id)
                .await?
                .is_some_and(|c| c.status == CommentStatus::Synced);
            missing |= !synced;
        }
        (review, revision, missing)
    };

    let input = ReviewInput {
        message: (with_message && !review.message.trim().is_empty()).then(|| review.message.clone()),
        labels: review.labels.clone(),
    };
    let result = guarded(token, timeout, client.post_review(&change.remote_change_id, &revision, &input)).await?;

    Ok(Applied::ReviewPosted {
        review_id,
        result,
        missing_comments,
    })
}

/// Upload a new patch set.
async fn process_push(
    client: &dyn RemoteClient,
    change: &Change,
    edits: &[FileEdit],
    message: &str,
    token: &CancellationToken,
    timeout: Duration,
) -> Result<Applied, AppError> {
    let pushed = guarded(
        token,
        timeout,
        client.push_patch_set(&change.remote_change_id, edits, message),
    )
    .await?;
    Ok(Applied::PatchSetPushed(pushed))
}

/// Record a confirmed remote mutation locally.
async fn apply_success(
    conn: &mut sqlx::SqliteConnection,
    change_id: i64,
    applied: Applied,
    now: i64,
) -> Result<(), AppError> {
    match applied {
        Applied::CommentPosted {
            comment_id,
            remote_id,
            sent_hash,
        } => {
            comments::mark_synced(conn, comment_id, Some(&remote_id), now).await?;
            settle_edits_in_flight(conn, comment_id, &sent_hash, now).await?;
        }
        Applied::CommentUpdated { comment_id, sent_hash } => {
            comments::mark_synced(conn, comment_id, None, now).await?;
            settle_edits_in_flight(conn, comment_id, &sent_hash, now).await?;
        }
        Applied::CommentDeleted { comment_id } => {
            if comments::get(conn, comment_id).await?.is_some() {
                if comments::reply_count(conn, comment_id).await? == 0 {
                    comments::hard_delete(conn, comment_id).await?;
                } else {
                    comments::set_status(conn, comment_id, CommentStatus::Synced, now).await?;
                }
            }
        }
        Applied::ReviewPosted {
            review_id,
            result,
            missing_comments,
        } => {
            let status = if result.is_partial() || missing_comments {
                ReviewStatus::PartiallySubmitted
            } else {
                ReviewStatus::Submitted
            };
            reviews::set_status(conn, review_id, status, now).await?;

            let mut baseline = changes::require(conn, change_id).await?.extensions.baseline_votes;
            for (label, value) in result.applied_labels {
                if value == 0 {
                    baseline.remove(&label);
                } else {
                    baseline.insert(label, value);
                }
            }
            changes::set_baseline_votes(conn, change_id, &baseline).await?;
            if !result.rejected_labels.is_empty() {
                log::warn!(
                    "Review {} submitted without label(s) {}",
                    review_id,
                    result.rejected_labels.join(", ")
                );
            }
        }
        Applied::PatchSetPushed(pushed) => {
            if pushed.number > patch_sets::max_number(conn, change_id).await? {
                let ps = patch_sets::insert(
                    conn,
                    change_id,
                    &patch_sets::NewPatchSet {
                        number: pushed.number,
                        revision: pushed.revision.clone(),
                        author: pushed.author.clone(),
                        kind: pushed.kind,
                        created_at: pushed.created,
                    },
                )
                .await?;
                let rows: Vec<files::NewFile> = pushed
                    .files
                    .iter()
                    .map(|f| files::NewFile {
                        path: f.path.clone(),
                        old_path: f.old_path.clone(),
                        change_type: f.change_type,
                        lines_inserted: f.lines_inserted,
                        lines_deleted: f.lines_deleted,
                        size_delta: f.size_delta,
                    })
                    .collect();
                files::upsert_batch(conn, change_id, ps.id, &rows).await?;
            }
            patch_sets::set_current(conn, change_id, pushed.number).await?;
            changes::set_current_revision(conn, change_id, &pushed.revision, pushed.number, now).await?;
            changes::recompute_totals(conn, change_id, now).await?;
        }
        Applied::Nothing => {}
    }
    Ok(())
}

/// The user may have edited a comment while its content was on the wire.
/// The server then holds `sent_hash`, not the current content.
async fn settle_edits_in_flight(
    conn: &mut sqlx::SqliteConnection,
    comment_id: i64,
    sent_hash: &str,
    now: i64,
) -> Result<(), AppError> {
    let Some(comment) = comments::get(conn, comment_id).await? else {
        return Ok(());
    };
    if comment.content_hash != sent_hash {
        comments::set_base_hash(conn, comment_id, sent_hash).await?;
        comments::set_status(conn, comment_id, CommentStatus::ModifiedLocally, now).await?;
    }
    Ok(())
}

/// Surface a terminal failure on the entity the entry carried.
async fn apply_failure(
    conn: &mut sqlx::SqliteConnection,
    payload: &OperationPayload,
    now: i64,
) -> Result<(), AppError> {
    if let Some(comment_id) = payload.comment_id() {
        if comments::get(conn, comment_id).await?.is_some() {
            comments::set_status(conn, comment_id, CommentStatus::SyncFailed, now).await?;
        }
    }
    if let Some(review_id) = payload.review_id() {
        reviews::set_status(conn, review_id, ReviewStatus::SubmissionFailed, now).await?;
    }
    Ok(())
}

/// Totals of one push phase.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PushSummary {
    pub completed: i64,
    pub retrying: i64,
    pub failed: i64,
    pub errors: Vec<String>,
}

/// Drain the queue for `scope` until no entry is ready.
///
/// Changes are looked up per entry so a change blocked by a conflict during
/// this phase stops being served.
pub async fn process_pending(
    ctx: &AppContext,
    client: &dyn RemoteClient,
    scope: &BatchScope,
    token: &CancellationToken,
) -> Result<PushSummary, AppError> {
    let policy = ctx.settings().queue;
    let mut summary = PushSummary::default();

    loop {
        if token.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let batch = {
            let mut conn = ctx.store.acquire().await?;
            operation_queue::next_batch(&mut conn, policy.batch_size, ctx.now(), scope).await?
        };
        if batch.is_empty() {
            break;
        }

        let mut progressed = false;
        for entry in &batch {
            let change = {
                let mut conn = ctx.store.acquire().await?;
                changes::require(&mut conn, entry.change_id).await?
            };
            if change.conflict_status.blocks_push() {
                continue;
            }
            let processed = process_entry(ctx, client, &change, entry, token).await?;
            match processed.outcome {
                EntryOutcome::Completed => summary.completed += 1,
                EntryOutcome::WillRetry { error } => {
                    summary.retrying += 1;
                    summary.errors.push(error);
                }
                EntryOutcome::Failed { error } => {
                    summary.failed += 1;
                    summary.errors.push(error);
                }
                EntryOutcome::Skipped => continue,
            }
            progressed = true;
        }
        if !progressed {
            break;
        }
    }

    Ok(summary)
}
