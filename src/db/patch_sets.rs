//! Patch set repository.

use crate::error::AppError;
use crate::models::{PatchSet, PatchSetKind};
use sqlx::SqliteConnection;

const COLUMNS: &str = "id, change_id, number, revision, author, kind, is_current, created_at";

#[derive(Debug, Clone)]
pub struct NewPatchSet {
    pub number: i64,
    pub revision: String,
    pub author: String,
    pub kind: PatchSetKind,
    pub created_at: i64,
}

pub async fn list_for_change(conn: &mut SqliteConnection, change_id: i64) -> Result<Vec<PatchSet>, AppError> {
    let rows = sqlx::query_as::<_, PatchSet>(&format!(
        "SELECT {COLUMNS} FROM patch_sets WHERE change_id = ? ORDER BY number"
    ))
    .bind(change_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Option<PatchSet>, AppError> {
    let row = sqlx::query_as::<_, PatchSet>(&format!("SELECT {COLUMNS} FROM patch_sets WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

pub async fn require(conn: &mut SqliteConnection, id: i64) -> Result<PatchSet, AppError> {
    get(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("PatchSet", id))
}

pub async fn find_by_number(
    conn: &mut SqliteConnection,
    change_id: i64,
    number: i64,
) -> Result<Option<PatchSet>, AppError> {
    let row = sqlx::query_as::<_, PatchSet>(&format!(
        "SELECT {COLUMNS} FROM patch_sets WHERE change_id = ? AND number = ?"
    ))
    .bind(change_id)
    .bind(number)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

pub async fn current(conn: &mut SqliteConnection, change_id: i64) -> Result<Option<PatchSet>, AppError> {
    let row = sqlx::query_as::<_, PatchSet>(&format!(
        "SELECT {COLUMNS} FROM patch_sets WHERE change_id = ? AND is_current = 1"
    ))
    .bind(change_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

pub async fn max_number(conn: &mut SqliteConnection, change_id: i64) -> Result<i64, AppError> {
    let max: Option<i64> = sqlx::query_scalar("SELECT MAX(number) FROM patch_sets WHERE change_id = ?")
        .bind(change_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(max.unwrap_or(0))
}

/// Append a patch set. The schema trigger rejects numbers that do not
/// exceed every existing number of the change.
pub async fn insert(
    conn: &mut SqliteConnection,
    change_id: i64,
    patch_set: &NewPatchSet,
) -> Result<PatchSet, AppError> {
    let row = sqlx::query_as::<_, PatchSet>(&format!(
        r#"
        INSERT INTO patch_sets (change_id, number, revision, author, kind, is_current, created_at)
        VALUES (?, ?, ?, ?, ?, 0, ?)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(change_id)
    .bind(patch_set.number)
    .bind(&patch_set.revision)
    .bind(&patch_set.author)
    .bind(patch_set.kind)
    .bind(patch_set.created_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

/// Move the current marker to patch set `number`.
pub async fn set_current(conn: &mut SqliteConnection, change_id: i64, number: i64) -> Result<(), AppError> {
    sqlx::query("UPDATE patch_sets SET is_current = 0 WHERE change_id = ? AND is_current = 1 AND number != ?")
        .bind(change_id)
        .bind(number)
        .execute(&mut *conn)
        .await?;

    let result = sqlx::query("UPDATE patch_sets SET is_current = 1 WHERE change_id = ? AND number = ?")
        .bind(change_id)
        .bind(number)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found_with_id("PatchSet", format!("{}/{}", change_id, number)));
    }
    Ok(())
}
