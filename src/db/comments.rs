//! Comment repository.

use crate::error::AppError;
use crate::models::{Comment, CommentRange, CommentSide, CommentStatus, ContentFingerprint};
use sqlx::SqliteConnection;
use std::collections::HashMap;

const COLUMNS: &str = "id, change_id, patch_set_id, file_path, side, line, start_line, start_character, \
                       end_line, end_character, message, author, unresolved, status, remote_id, parent_id, \
                       deleted, content_hash, base_hash, created_at, updated_at";

/// Fields for a new comment row.
#[derive(Debug, Clone)]
pub struct NewComment {
    pub change_id: i64,
    pub patch_set_id: i64,
    pub file_path: String,
    pub side: CommentSide,
    pub line: Option<i64>,
    pub range: Option<CommentRange>,
    pub message: String,
    pub author: String,
    pub unresolved: bool,
    pub parent_id: Option<i64>,
    pub status: CommentStatus,
    /// Server id; set for comments pulled from the remote.
    pub remote_id: Option<String>,
    pub created_at: i64,
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Option<Comment>, AppError> {
    let comment = sqlx::query_as::<_, Comment>(&format!("SELECT {COLUMNS} FROM comments WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(comment)
}

pub async fn require(conn: &mut SqliteConnection, id: i64) -> Result<Comment, AppError> {
    get(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("Comment", id))
}

async fn insert_row(
    conn: &mut SqliteConnection,
    comment: &NewComment,
    on_conflict: &str,
    now: i64,
) -> Result<Option<Comment>, AppError> {
    let hash = ContentFingerprint::of(&comment.message, comment.unresolved).encode();
    // Remote rows arrive already confirmed, so their base is their content.
    let base_hash = comment.remote_id.as_ref().map(|_| hash.clone());
    let range = comment.range.as_ref();

    let row = sqlx::query_as::<_, Comment>(&format!(
        r#"
        INSERT INTO comments (
            change_id, patch_set_id, file_path, side, line, start_line, start_character, end_line,
            end_character, message, author, unresolved, status, remote_id, parent_id, content_hash,
            base_hash, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        {on_conflict}
        RETURNING {COLUMNS}
        "#
    ))
    .bind(comment.change_id)
    .bind(comment.patch_set_id)
    .bind(&comment.file_path)
    .bind(comment.side)
    .bind(comment.line)
    .bind(range.map(|r| r.start_line))
    .bind(range.map(|r| r.start_character))
    .bind(range.map(|r| r.end_line))
    .bind(range.map(|r| r.end_character))
    .bind(&comment.message)
    .bind(&comment.author)
    .bind(comment.unresolved)
    .bind(comment.status)
    .bind(&comment.remote_id)
    .bind(comment.parent_id)
    .bind(&hash)
    .bind(&base_hash)
    .bind(comment.created_at)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

/// Insert a comment. Duplicates by the dedup tuple fail with a unique
/// constraint violation.
pub async fn insert(conn: &mut SqliteConnection, comment: &NewComment, now: i64) -> Result<Comment, AppError> {
    insert_row(conn, comment, "", now)
        .await?
        .ok_or_else(|| AppError::internal("Comment insert returned no row"))
}

/// Insert a comment unless it duplicates an existing row (by remote id or
/// the dedup tuple). Returns `None` when skipped.
pub async fn insert_if_absent(
    conn: &mut SqliteConnection,
    comment: &NewComment,
    now: i64,
) -> Result<Option<Comment>, AppError> {
    insert_row(conn, comment, "ON CONFLICT DO NOTHING", now).await
}

pub async fn find_by_remote_id(
    conn: &mut SqliteConnection,
    change_id: i64,
    remote_id: &str,
) -> Result<Option<Comment>, AppError> {
    let comment = sqlx::query_as::<_, Comment>(&format!(
        "SELECT {COLUMNS} FROM comments WHERE change_id = ? AND remote_id = ?"
    ))
    .bind(change_id)
    .bind(remote_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(comment)
}

/// A local comment without a remote id that matches the dedup tuple.
pub async fn find_unlinked(
    conn: &mut SqliteConnection,
    patch_set_id: i64,
    file_path: &str,
    line: Option<i64>,
    side: CommentSide,
    message: &str,
) -> Result<Option<Comment>, AppError> {
    let comment = sqlx::query_as::<_, Comment>(&format!(
        r#"
        SELECT {COLUMNS} FROM comments
        WHERE patch_set_id = ? AND file_path = ? AND COALESCE(line, -1) = COALESCE(?, -1)
          AND side = ? AND message = ? AND remote_id IS NULL AND deleted = 0
        "#
    ))
    .bind(patch_set_id)
    .bind(file_path)
    .bind(line)
    .bind(side)
    .bind(message)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(comment)
}

/// Comments of a change in creation order, deleted ones included.
pub async fn list_for_change(conn: &mut SqliteConnection, change_id: i64) -> Result<Vec<Comment>, AppError> {
    let comments = sqlx::query_as::<_, Comment>(&format!(
        "SELECT {COLUMNS} FROM comments WHERE change_id = ? ORDER BY created_at, id"
    ))
    .bind(change_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(comments)
}

/// Live comments whose content the server has not confirmed.
pub async fn unsynced_for_change(
    conn: &mut SqliteConnection,
    change_id: i64,
) -> Result<Vec<Comment>, AppError> {
    let comments = sqlx::query_as::<_, Comment>(&format!(
        "SELECT {COLUMNS} FROM comments WHERE change_id = ? AND deleted = 0 AND status != 'synced' ORDER BY id"
    ))
    .bind(change_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(comments)
}

/// remote id → local id for every linked comment of a change.
pub async fn remote_ids(conn: &mut SqliteConnection, change_id: i64) -> Result<HashMap<String, i64>, AppError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT remote_id, id FROM comments WHERE change_id = ? AND remote_id IS NOT NULL",
    )
    .bind(change_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().collect())
}

pub async fn live_reply_count(conn: &mut SqliteConnection, id: i64) -> Result<i64, AppError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comments WHERE parent_id = ? AND deleted = 0")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

pub async fn reply_count(conn: &mut SqliteConnection, id: i64) -> Result<i64, AppError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comments WHERE parent_id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

pub async fn set_parent(conn: &mut SqliteConnection, id: i64, parent_id: i64) -> Result<(), AppError> {
    sqlx::query("UPDATE comments SET parent_id = ? WHERE id = ? AND parent_id IS NULL")
        .bind(parent_id)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Replace the editable fields and recompute the content hash.
pub async fn update_content(
    conn: &mut SqliteConnection,
    id: i64,
    message: &str,
    unresolved: bool,
    status: CommentStatus,
    now: i64,
) -> Result<(), AppError> {
    let hash = ContentFingerprint::of(message, unresolved).encode();
    sqlx::query(
        "UPDATE comments SET message = ?, unresolved = ?, status = ?, content_hash = ?, updated_at = ? WHERE id = ?",
    )
    .bind(message)
    .bind(unresolved)
    .bind(status)
    .bind(hash)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    id: i64,
    status: CommentStatus,
    now: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE comments SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Record server confirmation: `Synced`, base = current content, and the
/// remote id when one was assigned.
pub async fn mark_synced(
    conn: &mut SqliteConnection,
    id: i64,
    remote_id: Option<&str>,
    now: i64,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE comments SET status = 'synced', remote_id = COALESCE(?, remote_id),
            base_hash = content_hash, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(remote_id)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Record `base` as the last content both sides agreed on.
pub async fn set_base_hash(conn: &mut SqliteConnection, id: i64, base: &str) -> Result<(), AppError> {
    sqlx::query("UPDATE comments SET base_hash = ? WHERE id = ?")
        .bind(base)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Adopt the remote content as the synced state.
pub async fn overwrite_from_remote(
    conn: &mut SqliteConnection,
    id: i64,
    message: &str,
    unresolved: bool,
    now: i64,
) -> Result<(), AppError> {
    let hash = ContentFingerprint::of(message, unresolved).encode();
    sqlx::query(
        r#"
        UPDATE comments SET message = ?, unresolved = ?, status = 'synced', content_hash = ?,
            base_hash = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(message)
    .bind(unresolved)
    .bind(&hash)
    .bind(&hash)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn soft_delete(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<(), AppError> {
    sqlx::query("UPDATE comments SET deleted = 1, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn hard_delete(conn: &mut SqliteConnection, id: i64) -> Result<(), AppError> {
    sqlx::query("DELETE FROM comments WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Mark every live comment with unconfirmed content `SyncFailed`.
pub async fn fail_unsynced(conn: &mut SqliteConnection, change_id: i64, now: i64) -> Result<u64, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE comments SET status = 'sync_failed', updated_at = ?
        WHERE change_id = ? AND deleted = 0 AND status IN ('local_only', 'sync_pending', 'modified_locally')
        "#,
    )
    .bind(now)
    .bind(change_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
