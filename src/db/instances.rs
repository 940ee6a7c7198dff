//! Instance repository.

use crate::error::AppError;
use crate::models::Instance;
use sqlx::SqliteConnection;

const COLUMNS: &str = "id, name, url, encrypted_credentials, is_active, polling_interval_secs, \
                       max_changes, requires_reauth, created_at, updated_at";

/// Fields for a new instance row.
#[derive(Debug, Clone)]
pub struct NewInstanceRow {
    pub name: String,
    pub url: String,
    pub encrypted_credentials: String,
    pub polling_interval_secs: i64,
    pub max_changes: i64,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    row: &NewInstanceRow,
    now: i64,
) -> Result<Instance, AppError> {
    let instance = sqlx::query_as::<_, Instance>(&format!(
        r#"
        INSERT INTO instances (name, url, encrypted_credentials, is_active, polling_interval_secs, max_changes, created_at, updated_at)
        VALUES (?, ?, ?, 0, ?, ?, ?, ?)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(&row.name)
    .bind(&row.url)
    .bind(&row.encrypted_credentials)
    .bind(row.polling_interval_secs)
    .bind(row.max_changes)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(instance)
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Option<Instance>, AppError> {
    let instance = sqlx::query_as::<_, Instance>(&format!("SELECT {COLUMNS} FROM instances WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(instance)
}

/// Like [`get`], but a missing row is an error.
pub async fn require(conn: &mut SqliteConnection, id: i64) -> Result<Instance, AppError> {
    get(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("Instance", id))
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Instance>, AppError> {
    let instances = sqlx::query_as::<_, Instance>(&format!("SELECT {COLUMNS} FROM instances ORDER BY id"))
        .fetch_all(&mut *conn)
        .await?;
    Ok(instances)
}

pub async fn active(conn: &mut SqliteConnection) -> Result<Option<Instance>, AppError> {
    let instance =
        sqlx::query_as::<_, Instance>(&format!("SELECT {COLUMNS} FROM instances WHERE is_active = 1"))
            .fetch_optional(&mut *conn)
            .await?;
    Ok(instance)
}

/// Make `id` the only active instance.
///
/// The old flag is cleared first so the single-active index never sees two
/// active rows, even inside the transaction.
pub async fn set_active(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<(), AppError> {
    sqlx::query("UPDATE instances SET is_active = 0, updated_at = ? WHERE is_active = 1 AND id != ?")
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    let result = sqlx::query("UPDATE instances SET is_active = 1, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found_with_id("Instance", id));
    }
    Ok(())
}

pub async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<bool, AppError> {
    let result = sqlx::query("DELETE FROM instances WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Oldest remaining instance, used to hand over the active flag.
pub async fn oldest(conn: &mut SqliteConnection) -> Result<Option<i64>, AppError> {
    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM instances ORDER BY id LIMIT 1")
        .fetch_optional(&mut *conn)
        .await?;
    Ok(id)
}

pub async fn set_requires_reauth(
    conn: &mut SqliteConnection,
    id: i64,
    requires_reauth: bool,
    now: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE instances SET requires_reauth = ?, updated_at = ? WHERE id = ?")
        .bind(requires_reauth)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Store fresh credentials and clear the re-authentication flag.
pub async fn update_credentials(
    conn: &mut SqliteConnection,
    id: i64,
    encrypted_credentials: &str,
    now: i64,
) -> Result<(), AppError> {
    let result = sqlx::query(
        "UPDATE instances SET encrypted_credentials = ?, requires_reauth = 0, updated_at = ? WHERE id = ?",
    )
    .bind(encrypted_credentials)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found_with_id("Instance", id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use tempfile::tempdir;

    fn row(url: &str) -> NewInstanceRow {
        NewInstanceRow {
            name: "Review".into(),
            url: url.into(),
            encrypted_credentials: "c2VhbGVk".into(),
            polling_interval_secs: 300,
            max_changes: 100,
        }
    }

    #[tokio::test]
    async fn test_single_active_instance_is_enforced_by_schema() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db")).await.unwrap();
        let mut conn = store.acquire().await.unwrap();

        let a = insert(&mut conn, &row("https://a.example"), 0).await.unwrap();
        let b = insert(&mut conn, &row("https://b.example"), 0).await.unwrap();

        set_active(&mut conn, a.id, 1).await.unwrap();
        set_active(&mut conn, b.id, 2).await.unwrap();

        let active_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE is_active = 1")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(active_rows, 1);
        assert_eq!(active(&mut conn).await.unwrap().unwrap().id, b.id);

        // Bypassing set_active trips the partial unique index.
        let direct = sqlx::query("UPDATE instances SET is_active = 1 WHERE id = ?")
            .bind(a.id)
            .execute(&mut *conn)
            .await;
        assert!(direct.is_err());
    }

    #[tokio::test]
    async fn test_set_active_unknown_instance() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db")).await.unwrap();
        let mut conn = store.acquire().await.unwrap();

        let result = set_active(&mut conn, 42, 0).await;
        assert!(matches!(result, Err(AppError::NotFound { .. })));
    }
}
