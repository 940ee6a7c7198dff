//! Change repository.

use crate::error::AppError;
use crate::models::{Change, ChangeExtensions, ChangeStatus, ConflictStatus, ImportStatus};
use sqlx::types::Json;
use sqlx::SqliteConnection;

const COLUMNS: &str = "id, instance_id, remote_change_id, number, project, branch, subject, status, owner, \
                       current_revision, current_patch_set_num, total_files, reviewed_files, total_comments, \
                       import_status, conflict_status, remote_updated_at, last_sync, extensions, created_at, updated_at";

/// Remote-owned metadata written on import and pull.
#[derive(Debug, Clone)]
pub struct ChangeMetadata {
    pub remote_change_id: String,
    pub number: i64,
    pub project: String,
    pub branch: String,
    pub subject: String,
    pub status: ChangeStatus,
    pub owner: String,
    pub current_revision: String,
    pub current_patch_set_num: i64,
    pub remote_updated_at: i64,
    pub topic: Option<String>,
    pub hashtags: Vec<String>,
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Option<Change>, AppError> {
    let change = sqlx::query_as::<_, Change>(&format!("SELECT {COLUMNS} FROM changes WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(change)
}

pub async fn require(conn: &mut SqliteConnection, id: i64) -> Result<Change, AppError> {
    get(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("Change", id))
}

pub async fn find_by_remote_id(
    conn: &mut SqliteConnection,
    instance_id: i64,
    remote_change_id: &str,
) -> Result<Option<Change>, AppError> {
    let change = sqlx::query_as::<_, Change>(&format!(
        "SELECT {COLUMNS} FROM changes WHERE instance_id = ? AND remote_change_id = ?"
    ))
    .bind(instance_id)
    .bind(remote_change_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(change)
}

pub async fn list_for_instance(
    conn: &mut SqliteConnection,
    instance_id: i64,
) -> Result<Vec<Change>, AppError> {
    let changes = sqlx::query_as::<_, Change>(&format!(
        "SELECT {COLUMNS} FROM changes WHERE instance_id = ? ORDER BY number DESC"
    ))
    .bind(instance_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(changes)
}

pub async fn count_for_instance(conn: &mut SqliteConnection, instance_id: i64) -> Result<i64, AppError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM changes WHERE instance_id = ?")
        .bind(instance_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Insert or refresh a change from remote metadata, leaving it `Importing`.
///
/// Local-only columns (counters, conflict status, extensions' baseline)
/// survive a refresh.
pub async fn upsert_importing(
    conn: &mut SqliteConnection,
    instance_id: i64,
    meta: &ChangeMetadata,
    now: i64,
) -> Result<Change, AppError> {
    let extensions = ChangeExtensions {
        topic: meta.topic.clone(),
        hashtags: meta.hashtags.clone(),
        ..Default::default()
    };

    sqlx::query(
        r#"
        INSERT INTO changes (
            instance_id, remote_change_id, number, project, branch, subject, status, owner,
            current_revision, current_patch_set_num, import_status, remote_updated_at, extensions,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'importing', ?, ?, ?, ?)
        ON CONFLICT(instance_id, remote_change_id) DO UPDATE SET
            number = excluded.number,
            project = excluded.project,
            branch = excluded.branch,
            subject = excluded.subject,
            status = excluded.status,
            owner = excluded.owner,
            current_revision = excluded.current_revision,
            current_patch_set_num = excluded.current_patch_set_num,
            import_status = 'importing',
            remote_updated_at = excluded.remote_updated_at,
            extensions = json_set(changes.extensions, '$.topic', json_extract(excluded.extensions, '$.topic'),
                                  '$.hashtags', json(json_extract(excluded.extensions, '$.hashtags'))),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(instance_id)
    .bind(&meta.remote_change_id)
    .bind(meta.number)
    .bind(&meta.project)
    .bind(&meta.branch)
    .bind(&meta.subject)
    .bind(meta.status)
    .bind(&meta.owner)
    .bind(&meta.current_revision)
    .bind(meta.current_patch_set_num)
    .bind(meta.remote_updated_at)
    .bind(Json(&extensions))
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    find_by_remote_id(conn, instance_id, &meta.remote_change_id)
        .await?
        .ok_or_else(|| AppError::internal("Upserted change vanished"))
}

/// Refresh remote metadata during a pull without touching import status.
pub async fn update_metadata(
    conn: &mut SqliteConnection,
    id: i64,
    meta: &ChangeMetadata,
    now: i64,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE changes SET
            subject = ?, status = ?, owner = ?, current_revision = ?, current_patch_set_num = ?,
            remote_updated_at = ?,
            extensions = json_set(extensions, '$.topic', ?, '$.hashtags', json(?)),
            last_sync = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&meta.subject)
    .bind(meta.status)
    .bind(&meta.owner)
    .bind(&meta.current_revision)
    .bind(meta.current_patch_set_num)
    .bind(meta.remote_updated_at)
    .bind(&meta.topic)
    .bind(serde_json::to_string(&meta.hashtags)?)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    id: i64,
    status: ChangeStatus,
    now: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE changes SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Record a patch set we uploaded ourselves as current. Leaves `last_sync`
/// alone so the next pull still compares against the previous sync.
pub async fn set_current_revision(
    conn: &mut SqliteConnection,
    id: i64,
    revision: &str,
    patch_set_num: i64,
    now: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE changes SET current_revision = ?, current_patch_set_num = ?, updated_at = ? WHERE id = ?")
        .bind(revision)
        .bind(patch_set_num)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_import_status(
    conn: &mut SqliteConnection,
    id: i64,
    status: ImportStatus,
    now: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE changes SET import_status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Mark an import finished: `Imported` and `last_sync = now`.
pub async fn mark_imported(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<(), AppError> {
    sqlx::query("UPDATE changes SET import_status = 'imported', last_sync = ?, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_conflict_status(
    conn: &mut SqliteConnection,
    id: i64,
    status: ConflictStatus,
    now: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE changes SET conflict_status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_baseline_votes(
    conn: &mut SqliteConnection,
    id: i64,
    votes: &std::collections::BTreeMap<String, i32>,
) -> Result<(), AppError> {
    sqlx::query("UPDATE changes SET extensions = json_set(extensions, '$.baseline_votes', json(?)) WHERE id = ?")
        .bind(serde_json::to_string(votes)?)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Recompute the derived counters from their source rows.
///
/// `total_files` and `reviewed_files` count the current patch set only, so
/// the CHECK `reviewed_files <= total_files` holds by construction.
pub async fn recompute_totals(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE changes SET
            total_files = (
                SELECT COUNT(*) FROM files f JOIN patch_sets p ON p.id = f.patch_set_id
                WHERE f.change_id = changes.id AND p.is_current = 1
            ),
            reviewed_files = (
                SELECT COUNT(*) FROM files f JOIN patch_sets p ON p.id = f.patch_set_id
                WHERE f.change_id = changes.id AND p.is_current = 1 AND f.review_status = 'reviewed'
            ),
            total_comments = (
                SELECT COUNT(*) FROM comments c WHERE c.change_id = changes.id AND c.deleted = 0
            ),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Ids of changes with queue entries that may still reach the server.
pub async fn with_pending_operations(
    conn: &mut SqliteConnection,
    instance_id: i64,
) -> Result<Vec<i64>, AppError> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT c.id FROM changes c
        JOIN operation_queue q ON q.change_id = c.id
        WHERE c.instance_id = ? AND q.status IN ('queued', 'processing', 'waiting_for_dependency')
        ORDER BY c.id
        "#,
    )
    .bind(instance_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}
