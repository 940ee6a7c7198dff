//! Review repository.

use crate::error::AppError;
use crate::models::{Review, ReviewStatus};
use sqlx::types::Json;
use sqlx::SqliteConnection;
use std::collections::BTreeMap;

const COLUMNS: &str = "id, change_id, patch_set_id, message, labels, comment_ids, status, submitted_at, \
                       created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewReview {
    pub change_id: i64,
    pub patch_set_id: i64,
    pub message: String,
    pub labels: BTreeMap<String, i32>,
    pub comment_ids: Vec<i64>,
    pub status: ReviewStatus,
}

pub async fn insert(conn: &mut SqliteConnection, review: &NewReview, now: i64) -> Result<Review, AppError> {
    let row = sqlx::query_as::<_, Review>(&format!(
        r#"
        INSERT INTO reviews (change_id, patch_set_id, message, labels, comment_ids, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(review.change_id)
    .bind(review.patch_set_id)
    .bind(&review.message)
    .bind(Json(&review.labels))
    .bind(Json(&review.comment_ids))
    .bind(review.status)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Option<Review>, AppError> {
    let row = sqlx::query_as::<_, Review>(&format!("SELECT {COLUMNS} FROM reviews WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

pub async fn require(conn: &mut SqliteConnection, id: i64) -> Result<Review, AppError> {
    get(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("Review", id))
}

pub async fn list_for_change(conn: &mut SqliteConnection, change_id: i64) -> Result<Vec<Review>, AppError> {
    let rows = sqlx::query_as::<_, Review>(&format!(
        "SELECT {COLUMNS} FROM reviews WHERE change_id = ? ORDER BY id"
    ))
    .bind(change_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Reviews whose votes have not reached the server yet.
pub async fn pending_for_change(conn: &mut SqliteConnection, change_id: i64) -> Result<Vec<Review>, AppError> {
    let rows = sqlx::query_as::<_, Review>(&format!(
        "SELECT {COLUMNS} FROM reviews WHERE change_id = ? AND status IN ('draft', 'pending_submission') ORDER BY id"
    ))
    .bind(change_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    id: i64,
    status: ReviewStatus,
    now: i64,
) -> Result<(), AppError> {
    let submitted_at = matches!(status, ReviewStatus::Submitted | ReviewStatus::PartiallySubmitted).then_some(now);
    sqlx::query(
        "UPDATE reviews SET status = ?, submitted_at = COALESCE(?, submitted_at), updated_at = ? WHERE id = ?",
    )
    .bind(status)
    .bind(submitted_at)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_labels(
    conn: &mut SqliteConnection,
    id: i64,
    labels: &BTreeMap<String, i32>,
    now: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE reviews SET labels = ?, updated_at = ? WHERE id = ?")
        .bind(Json(labels))
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
