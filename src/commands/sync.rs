//! Sync commands: run and cancel syncs, inspect status, settle conflicts and
//! handle failed queue entries.

use crate::context::AppContext;
use crate::db::{changes, comments, conflicts, instances, reviews, sync_runs};
use crate::error::AppError;
use crate::models::{
    CommentStatus, Conflict, OperationPayload, OperationQueueEntry, OperationStatus, ResolutionStrategy,
    ReviewStatus, SyncRun, SyncType,
};
use crate::services::operation_queue::{self, QueueCounts};
use crate::services::{conflict_resolver, sync_engine};
use crate::session::EngineState;
use serde::Serialize;

/// Response for [`get_sync_status`].
#[derive(Debug, Serialize)]
pub struct SyncStatus {
    pub instance_id: i64,
    pub state: EngineState,
    /// Whether a run holds the instance's run guard.
    pub is_running: bool,
    /// Queue entries of this instance by status.
    pub queue: QueueCounts,
    pub failed_operations: Vec<OperationQueueEntry>,
    pub open_conflicts: Vec<Conflict>,
    pub last_run: Option<SyncRun>,
    /// Set after the server rejected the stored credentials.
    pub requires_reauth: bool,
}

/// Run one sync of the active instance and wait for it to finish.
///
/// See [`sync_engine::sync_changes`] for scope and failure semantics.
pub async fn sync_changes(
    ctx: &AppContext,
    change_ids: Option<Vec<i64>>,
    sync_type: Option<SyncType>,
    strategy: Option<ResolutionStrategy>,
) -> Result<SyncRun, AppError> {
    sync_engine::sync_changes(
        ctx,
        change_ids,
        sync_type.unwrap_or_default(),
        strategy.unwrap_or_default(),
    )
    .await
}

/// Cancel the active instance's run, if any. Returns whether one was running.
pub async fn cancel_sync(ctx: &AppContext) -> Result<bool, AppError> {
    let instance_id = ctx.require_active_instance()?;
    let cancelled = ctx.session.cancel_run(instance_id);
    if cancelled {
        log::info!("Sync of instance {} cancelled", instance_id);
    }
    Ok(cancelled)
}

/// Open conflicts of one change, or of every change of the active instance.
pub async fn get_conflicts(ctx: &AppContext, change_id: Option<i64>) -> Result<Vec<Conflict>, AppError> {
    let mut conn = ctx.store.acquire().await?;
    match change_id {
        Some(change_id) => {
            changes::require(&mut conn, change_id).await?;
            conflicts::open_for_change(&mut conn, change_id).await
        }
        None => {
            let instance_id = ctx.require_active_instance()?;
            conflicts::open_for_instance(&mut conn, instance_id).await
        }
    }
}

pub async fn resolve_conflict(
    ctx: &AppContext,
    conflict_id: i64,
    strategy: ResolutionStrategy,
) -> Result<Conflict, AppError> {
    conflict_resolver::resolve_conflict(ctx, conflict_id, strategy).await
}

pub async fn get_sync_status(ctx: &AppContext) -> Result<SyncStatus, AppError> {
    let instance_id = ctx.require_active_instance()?;
    let mut conn = ctx.store.acquire().await?;
    let instance = instances::require(&mut conn, instance_id).await?;

    Ok(SyncStatus {
        instance_id,
        state: ctx.session.state(instance_id),
        is_running: ctx.session.is_running(instance_id),
        queue: operation_queue::counts(&mut conn, Some(instance_id)).await?,
        failed_operations: operation_queue::failed_entries(&mut conn, instance_id).await?,
        open_conflicts: conflicts::open_for_instance(&mut conn, instance_id).await?,
        last_run: sync_runs::latest(&mut conn, instance_id).await?,
        requires_reauth: instance.requires_reauth,
    })
}

/// Queue a terminally failed entry again with a fresh retry budget.
///
/// The entity it carries returns to its pending status.
pub async fn retry_failed_operation(ctx: &AppContext, entry_id: i64) -> Result<OperationQueueEntry, AppError> {
    let now = ctx.now();
    let entry = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                let entry = operation_queue::require(conn, entry_id).await?;
                if entry.status != OperationStatus::Failed {
                    return Err(AppError::validation(format!(
                        "Operation {} is {}, not failed",
                        entry_id, entry.status
                    )));
                }

                match &entry.payload {
                    OperationPayload::AddComment { comment_id } | OperationPayload::UpdateComment { comment_id } => {
                        if let Some(comment) = comments::get(conn, *comment_id).await? {
                            let status = if comment.remote_id.is_some() {
                                CommentStatus::ModifiedLocally
                            } else {
                                CommentStatus::LocalOnly
                            };
                            comments::set_status(conn, comment.id, status, now).await?;
                        }
                    }
                    OperationPayload::SubmitReview { review_id } | OperationPayload::UpdateLabels { review_id } => {
                        reviews::set_status(conn, *review_id, ReviewStatus::PendingSubmission, now).await?;
                    }
                    OperationPayload::DeleteComment { .. } | OperationPayload::PushPatchSet { .. } => {}
                }

                operation_queue::retry(conn, entry_id, now).await?;
                operation_queue::require(conn, entry_id).await
            })
        })
        .await?;

    log::info!("Operation {} ({}) queued for retry", entry.id, entry.operation_type);
    Ok(entry)
}

/// Give up on a terminally failed entry. The entity keeps its failed status
/// so the user can still see what never reached the server.
pub async fn discard_failed_operation(ctx: &AppContext, entry_id: i64) -> Result<(), AppError> {
    let now = ctx.now();
    ctx.store
        .transaction(move |conn| {
            Box::pin(async move {
                let entry = operation_queue::require(conn, entry_id).await?;
                if entry.status != OperationStatus::Failed {
                    return Err(AppError::validation(format!(
                        "Operation {} is {}, not failed",
                        entry_id, entry.status
                    )));
                }
                operation_queue::cancel(conn, entry_id, now).await
            })
        })
        .await?;

    log::info!("Discarded failed operation {}", entry_id);
    Ok(())
}

/// Leave the engine's `Error` state. Returns whether it was in it.
pub fn acknowledge_sync_error(ctx: &AppContext) -> Result<bool, AppError> {
    let instance_id = ctx.require_active_instance()?;
    Ok(ctx.session.acknowledge_error(instance_id))
}
