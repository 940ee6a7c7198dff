//! Change importer.
//!
//! Copies a remote change into the local store: metadata and patch sets in
//! one transaction, then files in batches, diffs of the current patch set
//! and published comments. An interrupted import leaves the change
//! `Importing`; calling [`import_change`] again resumes where it stopped.

use crate::config::ImportOptions;
use crate::context::AppContext;
use crate::db::{changes, comments, files, patch_sets};
use crate::error::AppError;
use crate::models::{Change, Comment, CommentStatus, ImportStatus, OperationType};
use crate::services::{conflict_resolver, operation_queue};
use crate::services::remote::{RemoteChange, RemoteClient, RemoteComment, RemoteFile};
use crate::services::sync_events::{ChangeUpdateType, SyncEvent};
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::sync::Arc;

/// Remote-owned metadata of `remote`.
pub(crate) fn metadata_of(remote: &RemoteChange) -> changes::ChangeMetadata {
    changes::ChangeMetadata {
        remote_change_id: remote.change_id.clone(),
        number: remote.number,
        project: remote.project.clone(),
        branch: remote.branch.clone(),
        subject: remote.subject.clone(),
        status: remote.status,
        owner: remote.owner.clone(),
        current_revision: remote.current_revision.clone(),
        current_patch_set_num: remote.current_patch_set_number(),
        remote_updated_at: remote.updated,
        topic: remote.topic.clone(),
        hashtags: remote.hashtags.clone(),
    }
}

/// Insert patch sets newer than the newest local one, in ascending order,
/// and move `is_current` to the remote current patch set.
///
/// Returns the numbers inserted.
pub(crate) async fn sync_patch_sets(
    conn: &mut SqliteConnection,
    change_id: i64,
    remote: &RemoteChange,
) -> Result<Vec<i64>, AppError> {
    let known = patch_sets::max_number(conn, change_id).await?;

    let mut fresh: Vec<_> = remote.patch_sets.iter().filter(|ps| ps.number > known).collect();
    fresh.sort_by_key(|ps| ps.number);

    let mut inserted = Vec::with_capacity(fresh.len());
    for ps in fresh {
        patch_sets::insert(
            conn,
            change_id,
            &patch_sets::NewPatchSet {
                number: ps.number,
                revision: ps.revision.clone(),
                author: ps.author.clone(),
                kind: ps.kind,
                created_at: ps.created,
            },
        )
        .await?;
        inserted.push(ps.number);
    }

    let current = remote.current_patch_set_number();
    if current > 0 {
        patch_sets::set_current(conn, change_id, current).await?;
    }
    Ok(inserted)
}

fn file_rows(listing: &[RemoteFile]) -> Vec<files::NewFile> {
    listing
        .iter()
        .map(|f| files::NewFile {
            path: f.path.clone(),
            old_path: f.old_path.clone(),
            change_type: f.change_type,
            lines_inserted: f.lines_inserted,
            lines_deleted: f.lines_deleted,
            size_delta: f.size_delta,
        })
        .collect()
}

/// Store the file listings of the given patch sets in one go.
///
/// Used by pulls, which add patch sets inside the reconcile transaction.
pub(crate) async fn store_patch_set_files(
    conn: &mut SqliteConnection,
    change_id: i64,
    remote: &RemoteChange,
    numbers: &[i64],
) -> Result<(), AppError> {
    for ps in remote.patch_sets.iter().filter(|ps| numbers.contains(&ps.number)) {
        let Some(local) = patch_sets::find_by_number(conn, change_id, ps.number).await? else {
            continue;
        };
        files::upsert_batch(conn, change_id, local.id, &file_rows(&ps.files)).await?;
    }
    Ok(())
}

/// Outcome of merging a remote comment listing into the store.
#[derive(Debug, Default)]
pub(crate) struct MergedComments {
    /// Remote comments stored for the first time, with their new rows.
    pub inserted: Vec<(Comment, RemoteComment)>,

    /// Local comments matched to their remote copy and marked synced.
    pub linked: Vec<i64>,

    /// Remote comments already known locally, with the local row.
    pub known: Vec<(Comment, RemoteComment)>,

    /// Remote ids present in the listing.
    pub seen: Vec<String>,
}

impl MergedComments {
    pub fn changed_anything(&self) -> bool {
        !self.inserted.is_empty() || !self.linked.is_empty()
    }
}

/// Store remote comments not yet known by remote id.
///
/// A remote comment that matches a local comment without remote id on the
/// dedup tuple is the server's copy of that comment, acknowledged before the
/// local write landed: the local row is linked and its pending `AddComment`
/// entries complete. Reply links are resolved after every row exists.
pub(crate) async fn merge_remote_comments(
    conn: &mut SqliteConnection,
    change_id: i64,
    remote_comments: &[RemoteComment],
    now: i64,
) -> Result<MergedComments, AppError> {
    let mut ids = comments::remote_ids(conn, change_id).await?;
    let mut patch_set_ids: HashMap<i64, Option<i64>> = HashMap::new();
    let mut merged = MergedComments::default();

    for rc in remote_comments {
        merged.seen.push(rc.id.clone());

        if let Some(&local_id) = ids.get(&rc.id) {
            let local = comments::require(conn, local_id).await?;
            merged.known.push((local, rc.clone()));
            continue;
        }

        let patch_set_id = match patch_set_ids.get(&rc.patch_set) {
            Some(id) => *id,
            None => {
                let id = patch_sets::find_by_number(conn, change_id, rc.patch_set)
                    .await?
                    .map(|ps| ps.id);
                patch_set_ids.insert(rc.patch_set, id);
                id
            }
        };
        let Some(patch_set_id) = patch_set_id else {
            log::debug!(
                "Skipping comment {} on unknown patch set {} of change {}",
                rc.id,
                rc.patch_set,
                change_id
            );
            continue;
        };

        if let Some(local) =
            comments::find_unlinked(conn, patch_set_id, &rc.path, rc.line, rc.side, &rc.message).await?
        {
            comments::mark_synced(conn, local.id, Some(&rc.id), now).await?;
            for entry in operation_queue::pending_for_comment(conn, local.id).await? {
                if entry.operation_type == OperationType::AddComment {
                    operation_queue::mark_completed(conn, entry.id, now).await?;
                }
            }
            log::info!("Linked local comment {} to remote comment {}", local.id, rc.id);
            ids.insert(rc.id.clone(), local.id);
            merged.linked.push(local.id);
            continue;
        }

        let row = comments::NewComment {
            change_id,
            patch_set_id,
            file_path: rc.path.clone(),
            side: rc.side,
            line: rc.line,
            range: rc.range,
            message: rc.message.clone(),
            author: rc.author.clone(),
            unresolved: rc.unresolved,
            parent_id: None,
            status: CommentStatus::Synced,
            remote_id: Some(rc.id.clone()),
            created_at: rc.updated,
        };
        match comments::insert_if_absent(conn, &row, now).await? {
            Some(comment) => {
                ids.insert(rc.id.clone(), comment.id);
                merged.inserted.push((comment, rc.clone()));
            }
            None => log::debug!("Remote comment {} duplicates a stored comment, skipped", rc.id),
        }
    }

    for rc in remote_comments {
        let Some(parent_remote) = rc.in_reply_to.as_deref() else {
            continue;
        };
        if let (Some(&child), Some(&parent)) = (ids.get(&rc.id), ids.get(parent_remote)) {
            comments::set_parent(conn, child, parent).await?;
        }
    }

    Ok(merged)
}

/// Import (or resume importing) a remote change.
pub async fn import_change(
    ctx: &AppContext,
    instance_id: i64,
    remote_change_id: &str,
    options: ImportOptions,
) -> Result<Change, AppError> {
    if remote_change_id.trim().is_empty() {
        return Err(AppError::validation_field("Change id is required", "remote_change_id"));
    }
    if options.batch_size == 0 {
        return Err(AppError::validation_field("Batch size must be positive", "batch_size"));
    }

    let (instance, client) = ctx.connect(instance_id).await?;

    {
        let mut conn = ctx.store.acquire().await?;
        let existing = changes::find_by_remote_id(&mut conn, instance_id, remote_change_id).await?;
        if existing.is_none() && changes::count_for_instance(&mut conn, instance_id).await? >= instance.max_changes {
            return Err(AppError::validation(format!(
                "Instance already holds the maximum of {} changes",
                instance.max_changes
            )));
        }
    }

    let remote = client.fetch_change(remote_change_id).await?;
    log::info!(
        "Importing change {} ({} patch sets) from {}",
        remote.number,
        remote.patch_sets.len(),
        instance.url
    );

    let now = ctx.now();
    let policy = ctx.settings().queue;
    let meta = metadata_of(&remote);
    let header = remote.clone();
    let change = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                let previous = changes::find_by_remote_id(conn, instance_id, &meta.remote_change_id).await?;
                let change = changes::upsert_importing(conn, instance_id, &meta, now).await?;
                sync_patch_sets(conn, change.id, &header).await?;
                // Local work queued against the old patch set still needs confirmation.
                if let Some(previous) = previous {
                    conflict_resolver::flag_newer_patch_set(conn, &previous, &header, &policy, now).await?;
                }
                Ok(change)
            })
        })
        .await?;

    if let Err(e) = import_contents(ctx, client, &change, &remote, options).await {
        if e.is_transient() || matches!(e, AppError::Cancelled) {
            log::warn!("Import of change {} interrupted, resumable: {}", change.number, e);
        } else {
            log::error!("Import of change {} failed: {}", change.number, e);
            let mut conn = ctx.store.acquire().await?;
            changes::set_import_status(&mut conn, change.id, ImportStatus::Failed, ctx.now()).await?;
        }
        return Err(e);
    }

    let imported = {
        let mut conn = ctx.store.acquire().await?;
        changes::require(&mut conn, change.id).await?
    };
    ctx.events.emit(SyncEvent::ChangeUpdated {
        change_id: imported.id,
        instance_id,
        update_type: ChangeUpdateType::Imported,
    });
    Ok(imported)
}

async fn import_contents(
    ctx: &AppContext,
    client: Arc<dyn RemoteClient>,
    change: &Change,
    remote: &RemoteChange,
    options: ImportOptions,
) -> Result<(), AppError> {
    import_files(ctx, change.id, remote, options.batch_size).await?;

    if options.include_diffs {
        import_diffs(ctx, client.as_ref(), change.id, remote).await?;
    }

    if options.include_comments {
        let remote_comments = client.fetch_comments(&remote.change_id).await?;
        let change_id = change.id;
        let now = ctx.now();
        let merged = ctx
            .store
            .transaction(move |conn| {
                Box::pin(async move { merge_remote_comments(conn, change_id, &remote_comments, now).await })
            })
            .await?;
        log::debug!(
            "Change {}: {} new comment(s), {} linked",
            change.number,
            merged.inserted.len(),
            merged.linked.len()
        );
    }

    let change_id = change.id;
    let votes = remote.votes.clone();
    let now = ctx.now();
    ctx.store
        .transaction(move |conn| {
            Box::pin(async move {
                changes::recompute_totals(conn, change_id, now).await?;
                changes::set_baseline_votes(conn, change_id, &votes).await?;
                changes::mark_imported(conn, change_id, now).await?;
                Ok(())
            })
        })
        .await
}

/// Persist file listings of every known patch set in batches.
async fn import_files(
    ctx: &AppContext,
    change_id: i64,
    remote: &RemoteChange,
    batch_size: usize,
) -> Result<(), AppError> {
    let total: usize = remote.patch_sets.iter().map(|ps| ps.files.len()).sum();
    let mut processed = 0usize;

    let mut ordered: Vec<_> = remote.patch_sets.iter().collect();
    ordered.sort_by_key(|ps| ps.number);

    for ps in ordered {
        let local = {
            let mut conn = ctx.store.acquire().await?;
            let Some(local) = patch_sets::find_by_number(&mut conn, change_id, ps.number).await? else {
                continue;
            };
            if files::count_for_patch_set(&mut conn, local.id).await? == ps.files.len() as i64 {
                processed += ps.files.len();
                continue;
            }
            local
        };

        for chunk in ps.files.chunks(batch_size) {
            let rows = file_rows(chunk);
            let patch_set_id = local.id;
            ctx.store
                .transaction(move |conn| {
                    Box::pin(async move { files::upsert_batch(conn, change_id, patch_set_id, &rows).await })
                })
                .await?;

            processed += chunk.len();
            ctx.events.emit(SyncEvent::ImportProgress {
                change_id,
                processed: processed as i64,
                total: total as i64,
            });
        }
    }
    Ok(())
}

/// Fetch diffs missing from the cache for the current patch set.
pub(crate) async fn import_diffs(
    ctx: &AppContext,
    client: &dyn RemoteClient,
    change_id: i64,
    remote: &RemoteChange,
) -> Result<(), AppError> {
    let (patch_set_id, missing) = {
        let mut conn = ctx.store.acquire().await?;
        let Some(current) = patch_sets::current(&mut conn, change_id).await? else {
            return Ok(());
        };
        (current.id, files::missing_diffs(&mut conn, current.id).await?)
    };

    for path in missing {
        let diff = client
            .fetch_file_diff(&remote.change_id, &remote.current_revision, &path)
            .await?;
        let mut conn = ctx.store.acquire().await?;
        files::set_diff(&mut conn, patch_set_id, &path, &diff).await?;
    }
    Ok(())
}
