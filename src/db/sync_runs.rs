//! Sync run history.

use crate::error::AppError;
use crate::models::{SyncRun, SyncRunState, SyncType};
use sqlx::types::Json;
use sqlx::SqliteConnection;

const COLUMNS: &str = "id, instance_id, sync_type, state, items_processed, items_total, conflicts_detected, \
                       errors, started_at, finished_at";

/// Counters collected over one run.
#[derive(Debug, Clone, Default)]
pub struct RunTotals {
    pub items_processed: i64,
    pub items_total: i64,
    pub conflicts_detected: i64,
    pub errors: Vec<String>,
}

pub async fn start(
    conn: &mut SqliteConnection,
    instance_id: i64,
    sync_type: SyncType,
    now: i64,
) -> Result<SyncRun, AppError> {
    let run = sqlx::query_as::<_, SyncRun>(&format!(
        r#"
        INSERT INTO sync_runs (instance_id, sync_type, state, started_at)
        VALUES (?, ?, 'running', ?)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(instance_id)
    .bind(sync_type)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(run)
}

pub async fn finish(
    conn: &mut SqliteConnection,
    id: i64,
    state: SyncRunState,
    totals: &RunTotals,
    now: i64,
) -> Result<SyncRun, AppError> {
    let run = sqlx::query_as::<_, SyncRun>(&format!(
        r#"
        UPDATE sync_runs SET state = ?, items_processed = ?, items_total = ?, conflicts_detected = ?,
            errors = ?, finished_at = ?
        WHERE id = ?
        RETURNING {COLUMNS}
        "#
    ))
    .bind(state)
    .bind(totals.items_processed)
    .bind(totals.items_total)
    .bind(totals.conflicts_detected)
    .bind(Json(&totals.errors))
    .bind(now)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    run.ok_or_else(|| AppError::not_found_with_id("SyncRun", id))
}

pub async fn latest(conn: &mut SqliteConnection, instance_id: i64) -> Result<Option<SyncRun>, AppError> {
    let run = sqlx::query_as::<_, SyncRun>(&format!(
        "SELECT {COLUMNS} FROM sync_runs WHERE instance_id = ? ORDER BY started_at DESC, id DESC LIMIT 1"
    ))
    .bind(instance_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(run)
}

/// Runs a crash left `Running` are closed as failed on startup.
pub async fn fail_abandoned(conn: &mut SqliteConnection, now: i64) -> Result<u64, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE sync_runs SET state = 'failed', finished_at = ?,
            errors = json_insert(errors, '$[#]', 'interrupted')
        WHERE state = 'running'
        "#,
    )
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Drop history older than `before`, keeping running entries.
pub async fn prune(conn: &mut SqliteConnection, before: i64) -> Result<u64, AppError> {
    let result = sqlx::query("DELETE FROM sync_runs WHERE state != 'running' AND started_at < ?")
        .bind(before)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
