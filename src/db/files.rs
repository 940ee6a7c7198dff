//! File repository.

use crate::error::AppError;
use crate::models::{ChangeFile, FileChangeType, FileReviewStatus};
use sqlx::SqliteConnection;

const COLUMNS: &str = "id, change_id, patch_set_id, path, old_path, change_type, review_status, \
                       lines_inserted, lines_deleted, size_delta, diff_content";

/// A file listing entry as reported by the server.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub path: String,
    pub old_path: Option<String>,
    pub change_type: FileChangeType,
    pub lines_inserted: i64,
    pub lines_deleted: i64,
    pub size_delta: i64,
}

/// Insert or refresh a batch of files of one patch set.
///
/// Re-importing a file keeps its review status and cached diff.
pub async fn upsert_batch(
    conn: &mut SqliteConnection,
    change_id: i64,
    patch_set_id: i64,
    files: &[NewFile],
) -> Result<(), AppError> {
    for file in files {
        sqlx::query(
            r#"
            INSERT INTO files (change_id, patch_set_id, path, old_path, change_type, lines_inserted, lines_deleted, size_delta)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(change_id, patch_set_id, path) DO UPDATE SET
                old_path = excluded.old_path,
                change_type = excluded.change_type,
                lines_inserted = excluded.lines_inserted,
                lines_deleted = excluded.lines_deleted,
                size_delta = excluded.size_delta
            "#,
        )
        .bind(change_id)
        .bind(patch_set_id)
        .bind(&file.path)
        .bind(&file.old_path)
        .bind(file.change_type)
        .bind(file.lines_inserted)
        .bind(file.lines_deleted)
        .bind(file.size_delta)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn count_for_patch_set(conn: &mut SqliteConnection, patch_set_id: i64) -> Result<i64, AppError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE patch_set_id = ?")
        .bind(patch_set_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Files of a patch set, without cached diffs.
pub async fn list_for_patch_set(
    conn: &mut SqliteConnection,
    patch_set_id: i64,
) -> Result<Vec<ChangeFile>, AppError> {
    let files = sqlx::query_as::<_, ChangeFile>(
        "SELECT id, change_id, patch_set_id, path, old_path, change_type, review_status, \
         lines_inserted, lines_deleted, size_delta, NULL AS diff_content \
         FROM files WHERE patch_set_id = ? ORDER BY path",
    )
    .bind(patch_set_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(files)
}

pub async fn find(
    conn: &mut SqliteConnection,
    patch_set_id: i64,
    path: &str,
) -> Result<Option<ChangeFile>, AppError> {
    let file = sqlx::query_as::<_, ChangeFile>(&format!(
        "SELECT {COLUMNS} FROM files WHERE patch_set_id = ? AND path = ?"
    ))
    .bind(patch_set_id)
    .bind(path)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(file)
}

/// Paths of the patch set whose diff is not cached yet.
pub async fn missing_diffs(conn: &mut SqliteConnection, patch_set_id: i64) -> Result<Vec<String>, AppError> {
    let paths: Vec<String> = sqlx::query_scalar(
        "SELECT path FROM files WHERE patch_set_id = ? AND diff_content IS NULL ORDER BY path",
    )
    .bind(patch_set_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(paths)
}

pub async fn set_diff(
    conn: &mut SqliteConnection,
    patch_set_id: i64,
    path: &str,
    diff: &str,
) -> Result<(), AppError> {
    sqlx::query("UPDATE files SET diff_content = ? WHERE patch_set_id = ? AND path = ?")
        .bind(diff)
        .bind(patch_set_id)
        .bind(path)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_review_status(
    conn: &mut SqliteConnection,
    patch_set_id: i64,
    path: &str,
    status: FileReviewStatus,
) -> Result<(), AppError> {
    let result = sqlx::query("UPDATE files SET review_status = ? WHERE patch_set_id = ? AND path = ?")
        .bind(status)
        .bind(patch_set_id)
        .bind(path)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found_with_id("File", path));
    }
    Ok(())
}
