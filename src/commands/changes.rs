//! Change commands: search the server, import changes and browse the local
//! copies.

use crate::config::ImportOptions;
use crate::context::AppContext;
use crate::db::{changes, files, patch_sets};
use crate::error::AppError;
use crate::models::{Change, ChangeFile, FileReviewStatus, PatchSet};
use crate::services::importer;
use crate::services::remote::RemoteChangeSummary;
use crate::services::sync_events::{ChangeUpdateType, SyncEvent};
use crate::services::sync_processor::guarded;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Upper bound for `search_changes`.
const MAX_SEARCH_RESULTS: u32 = 100;

/// A local change with its patch sets and current files.
#[derive(Debug, Serialize)]
pub struct ChangeDetail {
    pub change: Change,
    pub patch_sets: Vec<PatchSet>,
    /// Files of the current patch set, without cached diffs.
    pub files: Vec<ChangeFile>,
}

/// Import a change of the active instance for offline review.
///
/// Importing an already imported change refreshes it and only adds what is
/// new on the server. `options` defaults to the configured import settings.
pub async fn import_change(
    ctx: &AppContext,
    remote_change_id: &str,
    options: Option<ImportOptions>,
) -> Result<Change, AppError> {
    let instance_id = ctx.require_active_instance()?;
    let options = options.unwrap_or(ctx.settings().import);
    importer::import_change(ctx, instance_id, remote_change_id, options).await
}

/// Query the active instance's server.
///
/// # Arguments
/// * `query` - Server search expression, e.g. `status:open owner:self`
/// * `limit` - Maximum results, capped at 100
pub async fn search_changes(ctx: &AppContext, query: &str, limit: u32) -> Result<Vec<RemoteChangeSummary>, AppError> {
    let instance_id = ctx.require_active_instance()?;
    let (_, client) = ctx.connect(instance_id).await?;
    let limit = limit.clamp(1, MAX_SEARCH_RESULTS);
    let timeout = ctx.settings().request_timeout();
    guarded(&CancellationToken::new(), timeout, client.search_changes(query.trim(), limit)).await
}

/// Changes imported from the active instance, newest number first.
pub async fn list_changes(ctx: &AppContext) -> Result<Vec<Change>, AppError> {
    let instance_id = ctx.require_active_instance()?;
    let mut conn = ctx.store.acquire().await?;
    changes::list_for_instance(&mut conn, instance_id).await
}

pub async fn get_change(ctx: &AppContext, change_id: i64) -> Result<ChangeDetail, AppError> {
    let mut conn = ctx.store.acquire().await?;
    let change = changes::require(&mut conn, change_id).await?;
    let patch_sets = patch_sets::list_for_change(&mut conn, change_id).await?;
    let files = match patch_sets.iter().find(|ps| ps.is_current) {
        Some(current) => files::list_for_patch_set(&mut conn, current.id).await?,
        None => Vec::new(),
    };
    Ok(ChangeDetail {
        change,
        patch_sets,
        files,
    })
}

/// Mark a file of the current patch set reviewed or unreviewed.
///
/// Purely local; nothing is queued.
pub async fn mark_file_reviewed(
    ctx: &AppContext,
    change_id: i64,
    file_path: &str,
    reviewed: bool,
) -> Result<Change, AppError> {
    let status = if reviewed {
        FileReviewStatus::Reviewed
    } else {
        FileReviewStatus::Unreviewed
    };
    let path = file_path.to_string();
    let now = ctx.now();

    let change = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                changes::require(conn, change_id).await?;
                let current = patch_sets::current(conn, change_id)
                    .await?
                    .ok_or_else(|| AppError::validation("Change has no patch set yet"))?;
                files::set_review_status(conn, current.id, &path, status).await?;
                changes::recompute_totals(conn, change_id, now).await?;
                changes::require(conn, change_id).await
            })
        })
        .await?;

    ctx.events.emit(SyncEvent::ChangeUpdated {
        change_id,
        instance_id: change.instance_id,
        update_type: ChangeUpdateType::MetadataUpdated,
    });
    Ok(change)
}
