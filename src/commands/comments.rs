//! Comment commands for drafting, replying to, editing and deleting review
//! comments offline.
//!
//! Every mutation writes the local row and its queue entry in one
//! transaction, so a comment never exists without the operation that will
//! publish it (and vice versa).

use crate::context::AppContext;
use crate::db::{changes, comments, instances, patch_sets};
use crate::db::comments::NewComment;
use crate::error::AppError;
use crate::models::{
    Change, Comment, CommentRange, CommentSide, CommentStatus, CommentThreads, NewOperation, OperationPayload,
    OperationStatus, OperationType,
};
use crate::services::credentials::open_credentials;
use crate::services::operation_queue;
use crate::services::sync_events::{ChangeUpdateType, SyncEvent};
use serde::Deserialize;
use sqlx::SqliteConnection;

/// Input for [`create_comment`].
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCommentInput {
    pub change_id: i64,
    /// Patch set number; the current patch set when omitted.
    pub patch_set: Option<i64>,
    pub file_path: String,
    pub side: Option<CommentSide>,
    /// 1-based line; `None` for a file-level comment.
    pub line: Option<i64>,
    pub range: Option<CommentRange>,
    pub message: String,
    #[serde(default)]
    pub unresolved: bool,
}

/// Input for [`edit_comment`]. Omitted fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EditCommentInput {
    pub message: Option<String>,
    pub unresolved: Option<bool>,
}

fn validate_message(message: &str) -> Result<String, AppError> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation_field("Comment message must not be empty", "message"));
    }
    Ok(trimmed.to_string())
}

fn validate_anchor(line: Option<i64>, range: Option<&CommentRange>) -> Result<(), AppError> {
    if matches!(line, Some(l) if l < 1) {
        return Err(AppError::validation_field("Line numbers start at 1", "line"));
    }
    if let Some(r) = range {
        if r.start_line < 1 || r.start_line > r.end_line {
            return Err(AppError::validation_field("Invalid comment range", "range"));
        }
        if r.start_line == r.end_line && r.start_character > r.end_character {
            return Err(AppError::validation_field("Invalid comment range", "range"));
        }
    }
    Ok(())
}

fn require_imported(change: &Change) -> Result<(), AppError> {
    if !change.is_imported() {
        return Err(AppError::validation(format!(
            "Change {} is not imported yet",
            change.number
        )));
    }
    Ok(())
}

/// Username the comments of `change` are authored as.
async fn author_for(ctx: &AppContext, conn: &mut SqliteConnection, change: &Change) -> Result<String, AppError> {
    let instance = instances::require(conn, change.instance_id).await?;
    Ok(open_credentials(ctx.vault.as_ref(), &instance.encrypted_credentials)?.username)
}

fn duplicate() -> AppError {
    AppError::validation_field("An identical comment already exists at this location", "message")
}

fn comments_updated(ctx: &AppContext, change: &Change) {
    ctx.events.emit(SyncEvent::ChangeUpdated {
        change_id: change.id,
        instance_id: change.instance_id,
        update_type: ChangeUpdateType::CommentsUpdated,
    });
}

/// Draft a comment and queue it for publishing.
///
/// # Errors
/// - Validation error for an empty message, a bad anchor, an unimported
///   change or a duplicate of an existing comment
/// - NotFound if the change or patch set does not exist
pub async fn create_comment(ctx: &AppContext, input: CreateCommentInput) -> Result<Comment, AppError> {
    let message = validate_message(&input.message)?;
    validate_anchor(input.line, input.range.as_ref())?;
    if input.file_path.trim().is_empty() {
        return Err(AppError::validation_field("File path must not be empty", "file_path"));
    }

    let (change, author) = {
        let mut conn = ctx.store.acquire().await?;
        let change = changes::require(&mut conn, input.change_id).await?;
        require_imported(&change)?;
        let author = author_for(ctx, &mut conn, &change).await?;
        (change, author)
    };

    let change_id = change.id;
    let policy = ctx.settings().queue;
    let now = ctx.now();
    let comment = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                let patch_set = match input.patch_set {
                    Some(number) => patch_sets::find_by_number(conn, change_id, number)
                        .await?
                        .ok_or_else(|| AppError::not_found_with_id("PatchSet", number))?,
                    None => patch_sets::current(conn, change_id)
                        .await?
                        .ok_or_else(|| AppError::validation("Change has no patch set yet"))?,
                };
                let row = NewComment {
                    change_id,
                    patch_set_id: patch_set.id,
                    file_path: input.file_path.trim().to_string(),
                    side: input.side.unwrap_or(CommentSide::Revision),
                    line: input.line,
                    range: input.range,
                    message,
                    author,
                    unresolved: input.unresolved,
                    parent_id: None,
                    status: CommentStatus::LocalOnly,
                    remote_id: None,
                    created_at: now,
                };
                let comment = comments::insert_if_absent(conn, &row, now).await?.ok_or_else(duplicate)?;
                operation_queue::enqueue(
                    conn,
                    &NewOperation::new(change_id, OperationPayload::AddComment { comment_id: comment.id }),
                    &policy,
                    now,
                )
                .await?;
                changes::recompute_totals(conn, change_id, now).await?;
                Ok(comment)
            })
        })
        .await?;

    log::debug!("Drafted comment {} on change {}", comment.id, change.number);
    comments_updated(ctx, &change);
    Ok(comment)
}

/// Draft a reply anchored where its parent is.
///
/// `unresolved` defaults to the parent's flag.
pub async fn reply_to_comment(
    ctx: &AppContext,
    parent_id: i64,
    message: &str,
    unresolved: Option<bool>,
) -> Result<Comment, AppError> {
    let message = validate_message(message)?;

    let (change, parent, author) = {
        let mut conn = ctx.store.acquire().await?;
        let parent = comments::require(&mut conn, parent_id).await?;
        if parent.deleted {
            return Err(AppError::validation("Cannot reply to a deleted comment"));
        }
        let change = changes::require(&mut conn, parent.change_id).await?;
        require_imported(&change)?;
        let author = author_for(ctx, &mut conn, &change).await?;
        (change, parent, author)
    };

    let policy = ctx.settings().queue;
    let now = ctx.now();
    let row = NewComment {
        change_id: parent.change_id,
        patch_set_id: parent.patch_set_id,
        file_path: parent.file_path.clone(),
        side: parent.side,
        line: parent.line,
        range: parent.range(),
        message,
        author,
        unresolved: unresolved.unwrap_or(parent.unresolved),
        parent_id: Some(parent.id),
        status: CommentStatus::LocalOnly,
        remote_id: None,
        created_at: now,
    };
    let change_id = change.id;
    let reply = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                let reply = comments::insert_if_absent(conn, &row, now).await?.ok_or_else(duplicate)?;
                operation_queue::enqueue(
                    conn,
                    &NewOperation::new(change_id, OperationPayload::AddComment { comment_id: reply.id }),
                    &policy,
                    now,
                )
                .await?;
                changes::recompute_totals(conn, change_id, now).await?;
                Ok(reply)
            })
        })
        .await?;

    comments_updated(ctx, &change);
    Ok(reply)
}

/// Edit a comment's message or unresolved flag.
///
/// Edits to a comment whose add or update is still queued are folded into
/// that entry, which reads the comment when it runs. Otherwise an update is
/// queued, or the add is queued again when the comment never reached the
/// server.
pub async fn edit_comment(ctx: &AppContext, comment_id: i64, input: EditCommentInput) -> Result<Comment, AppError> {
    let message = input.message.as_deref().map(validate_message).transpose()?;
    let policy = ctx.settings().queue;
    let now = ctx.now();

    let (comment, changed) = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                let current = comments::require(conn, comment_id).await?;
                if current.deleted {
                    return Err(AppError::validation("Cannot edit a deleted comment"));
                }
                if current.status == CommentStatus::ConflictDetected {
                    return Err(AppError::validation(
                        "Resolve the conflict on this comment before editing it",
                    ));
                }

                let message = message.unwrap_or_else(|| current.message.clone());
                let unresolved = input.unresolved.unwrap_or(current.unresolved);
                if message == current.message && unresolved == current.unresolved {
                    return Ok((current, false));
                }

                let pending = operation_queue::pending_for_comment(conn, comment_id).await?;
                let folded = pending.iter().find(|e| {
                    matches!(e.operation_type, OperationType::AddComment | OperationType::UpdateComment)
                        && matches!(e.status, OperationStatus::Queued | OperationStatus::WaitingForDependency)
                });
                let add_in_flight = pending.iter().any(|e| e.operation_type == OperationType::AddComment);

                let status = if let Some(entry) = folded {
                    log::debug!("Folding edit of comment {} into queued entry {}", comment_id, entry.id);
                    current.status
                } else if current.remote_id.is_none() && !add_in_flight {
                    retire_failed_entries(conn, current.change_id, comment_id, now).await?;
                    operation_queue::enqueue(
                        conn,
                        &NewOperation::new(current.change_id, OperationPayload::AddComment { comment_id }),
                        &policy,
                        now,
                    )
                    .await?;
                    CommentStatus::LocalOnly
                } else {
                    retire_failed_entries(conn, current.change_id, comment_id, now).await?;
                    operation_queue::enqueue(
                        conn,
                        &NewOperation::new(current.change_id, OperationPayload::UpdateComment { comment_id }),
                        &policy,
                        now,
                    )
                    .await?;
                    CommentStatus::ModifiedLocally
                };

                comments::update_content(conn, comment_id, &message, unresolved, status, now).await?;
                Ok((comments::require(conn, comment_id).await?, true))
            })
        })
        .await?;

    if changed {
        let mut conn = ctx.store.acquire().await?;
        let change = changes::require(&mut conn, comment.change_id).await?;
        comments_updated(ctx, &change);
    }
    Ok(comment)
}

/// Cancel terminal failures for a comment that is being queued again, so a
/// later manual retry cannot send it twice.
async fn retire_failed_entries(
    conn: &mut SqliteConnection,
    change_id: i64,
    comment_id: i64,
    now: i64,
) -> Result<(), AppError> {
    let entries = operation_queue::entries_for_change(conn, change_id).await?;
    for entry in entries {
        if entry.status == OperationStatus::Failed && entry.payload.comment_id() == Some(comment_id) {
            operation_queue::cancel(conn, entry.id, now).await?;
        }
    }
    Ok(())
}

/// Delete a comment.
///
/// A comment that never reached the server is dropped locally with its
/// queued entries. A published one is hidden and a delete is queued.
/// Deleting an already deleted comment is a no-op.
///
/// # Errors
/// - Validation error when a local-only comment has live replies or its
///   add is being sent right now
pub async fn delete_comment(ctx: &AppContext, comment_id: i64) -> Result<(), AppError> {
    let policy = ctx.settings().queue;
    let now = ctx.now();

    let change_id = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                let comment = comments::require(conn, comment_id).await?;
                if comment.deleted {
                    return Ok(None);
                }
                let pending = operation_queue::pending_for_comment(conn, comment_id).await?;

                match comment.remote_id.clone() {
                    None => {
                        if comments::live_reply_count(conn, comment_id).await? > 0 {
                            return Err(AppError::validation("Delete the replies to this comment first"));
                        }
                        if pending.iter().any(|e| e.status == OperationStatus::Processing) {
                            return Err(AppError::validation("Comment is being published; try again shortly"));
                        }
                        operation_queue::cancel_for_change(conn, comment.change_id, Some(comment_id), now).await?;
                        retire_failed_entries(conn, comment.change_id, comment_id, now).await?;
                        if comments::reply_count(conn, comment_id).await? == 0 {
                            comments::hard_delete(conn, comment_id).await?;
                        } else {
                            comments::soft_delete(conn, comment_id, now).await?;
                        }
                    }
                    Some(remote_id) => {
                        operation_queue::cancel_for_change(conn, comment.change_id, Some(comment_id), now).await?;
                        retire_failed_entries(conn, comment.change_id, comment_id, now).await?;
                        comments::soft_delete(conn, comment_id, now).await?;
                        operation_queue::enqueue(
                            conn,
                            &NewOperation::new(
                                comment.change_id,
                                OperationPayload::DeleteComment { comment_id, remote_id },
                            ),
                            &policy,
                            now,
                        )
                        .await?;
                    }
                }

                changes::recompute_totals(conn, comment.change_id, now).await?;
                Ok(Some(comment.change_id))
            })
        })
        .await?;

    if let Some(change_id) = change_id {
        let mut conn = ctx.store.acquire().await?;
        let change = changes::require(&mut conn, change_id).await?;
        comments_updated(ctx, &change);
    }
    Ok(())
}

/// Comments of a change arranged into reply threads.
///
/// Deleted comments that still anchor replies are included with
/// `deleted = true`.
pub async fn get_comment_threads(ctx: &AppContext, change_id: i64) -> Result<CommentThreads, AppError> {
    let mut conn = ctx.store.acquire().await?;
    changes::require(&mut conn, change_id).await?;
    let all = comments::list_for_change(&mut conn, change_id).await?;
    Ok(CommentThreads::from_comments(all))
}
