//! Conflict repository.

use crate::error::AppError;
use crate::models::{Conflict, ConflictDetail, ResolutionStrategy};
use sqlx::types::Json;
use sqlx::SqliteConnection;

const COLUMNS: &str = "id, change_id, kind, detail, state, resolution, detected_at, resolved_at";

pub async fn insert(
    conn: &mut SqliteConnection,
    change_id: i64,
    detail: &ConflictDetail,
    now: i64,
) -> Result<Conflict, AppError> {
    let row = sqlx::query_as::<_, Conflict>(&format!(
        r#"
        INSERT INTO conflicts (change_id, kind, detail, state, detected_at)
        VALUES (?, ?, ?, 'open', ?)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(change_id)
    .bind(detail.kind())
    .bind(Json(detail))
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Option<Conflict>, AppError> {
    let row = sqlx::query_as::<_, Conflict>(&format!("SELECT {COLUMNS} FROM conflicts WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

pub async fn require(conn: &mut SqliteConnection, id: i64) -> Result<Conflict, AppError> {
    get(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("Conflict", id))
}

pub async fn open_for_change(conn: &mut SqliteConnection, change_id: i64) -> Result<Vec<Conflict>, AppError> {
    let rows = sqlx::query_as::<_, Conflict>(&format!(
        "SELECT {COLUMNS} FROM conflicts WHERE change_id = ? AND state = 'open' ORDER BY id"
    ))
    .bind(change_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Open conflicts of every change of an instance.
pub async fn open_for_instance(conn: &mut SqliteConnection, instance_id: i64) -> Result<Vec<Conflict>, AppError> {
    let rows = sqlx::query_as::<_, Conflict>(&format!(
        r#"
        SELECT {COLUMNS} FROM conflicts
        WHERE state = 'open' AND change_id IN (SELECT id FROM changes WHERE instance_id = ?)
        ORDER BY change_id, id
        "#
    ))
    .bind(instance_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Replace the recorded sides of an open conflict with a fresher detection.
pub async fn update_detail(
    conn: &mut SqliteConnection,
    id: i64,
    detail: &ConflictDetail,
    now: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE conflicts SET detail = ?, detected_at = ? WHERE id = ?")
        .bind(Json(detail))
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Record a requested strategy on an open conflict without closing it.
pub async fn set_requested_resolution(
    conn: &mut SqliteConnection,
    id: i64,
    strategy: ResolutionStrategy,
) -> Result<(), AppError> {
    sqlx::query("UPDATE conflicts SET resolution = ? WHERE id = ? AND state = 'open'")
        .bind(strategy)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn resolve(
    conn: &mut SqliteConnection,
    id: i64,
    strategy: ResolutionStrategy,
    now: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE conflicts SET state = 'resolved', resolution = ?, resolved_at = ? WHERE id = ?")
        .bind(strategy)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures;
    use crate::models::{ChangeStatus, ConflictKind, ConflictState};

    #[tokio::test]
    async fn test_open_then_resolve() {
        let (_dir, store) = fixtures::open_store().await;
        let mut conn = store.acquire().await.unwrap();
        let (change, _ps) = fixtures::change_with_patch_set(&mut conn).await;

        let detail = ConflictDetail::Status {
            local: ChangeStatus::New,
            remote: ChangeStatus::Abandoned,
        };
        let conflict = insert(&mut conn, change.id, &detail, 10).await.unwrap();
        assert_eq!(conflict.kind, ConflictKind::Status);
        assert_eq!(conflict.detail, detail);
        assert!(conflict.is_open());
        assert_eq!(open_for_instance(&mut conn, change.instance_id).await.unwrap().len(), 1);

        resolve(&mut conn, conflict.id, ResolutionStrategy::RemoteWins, 20).await.unwrap();
        let resolved = require(&mut conn, conflict.id).await.unwrap();
        assert_eq!(resolved.state, ConflictState::Resolved);
        assert_eq!(resolved.resolution, Some(ResolutionStrategy::RemoteWins));
        assert!(open_for_change(&mut conn, change.id).await.unwrap().is_empty());
    }
}
