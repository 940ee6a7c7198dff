//! Transactional access to the local store.
//!
//! Every multi-entity update goes through [`Store::transaction`] (or an
//! explicit [`Store::begin`]) so that either all of its writes land or none
//! do. Repository functions in the sibling modules take a
//! `&mut SqliteConnection` and therefore compose inside one transaction.

use super::pool::DbPool;
use super::StorageError;
use crate::error::AppError;
use futures::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::path::Path;

/// Handle to the local SQLite store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    /// Wrap an already-migrated pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open (creating and migrating if needed) the database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self, StorageError> {
        let pool = super::initialize(db_path).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Borrow a pooled connection for reads or single-statement writes.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>, AppError> {
        Ok(self.pool.acquire().await.map_err(StorageError::from)?)
    }

    /// Start a transaction. Dropping it without `commit` rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, AppError> {
        Ok(self.pool.begin().await.map_err(StorageError::from)?)
    }

    /// Run `f` inside a single transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back and returns the error
    /// otherwise, so a failing constraint never leaves partial writes.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, AppError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, AppError>> + Send,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await.map_err(StorageError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    log::warn!("Rollback failed after error '{}': {}", e, rollback_err);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("store.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_transaction_commits_on_ok() {
        let (_dir, store) = open_store().await;

        store
            .transaction(|conn| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO instances (name, url, encrypted_credentials, created_at, updated_at) VALUES ('a', 'https://a.example', 'x', 0, 0)",
                    )
                    .execute(&mut *conn)
                    .await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM instances")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_constraint_violation_rolls_back_whole_transaction() {
        let (_dir, store) = open_store().await;

        let result = store
            .transaction(|conn| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO instances (name, url, encrypted_credentials, created_at, updated_at) VALUES ('a', 'https://a.example', 'x', 0, 0)",
                    )
                    .execute(&mut *conn)
                    .await?;
                    // Violates the https CHECK constraint
                    sqlx::query(
                        "INSERT INTO instances (name, url, encrypted_credentials, created_at, updated_at) VALUES ('b', 'http://b.example', 'x', 0, 0)",
                    )
                    .execute(&mut *conn)
                    .await?;
                    Ok(())
                })
            })
            .await;

        assert!(matches!(result, Err(AppError::Storage { .. })));

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM instances")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_check_violation_is_classified() {
        let (_dir, store) = open_store().await;
        let err = sqlx::query(
            "INSERT INTO instances (name, url, encrypted_credentials, created_at, updated_at) VALUES ('b', 'http://b.example', 'x', 0, 0)",
        )
        .execute(store.pool())
        .await
        .unwrap_err();

        let storage = StorageError::from(err);
        assert_eq!(storage.constraint_kind(), Some(super::super::ConstraintKind::Check));
    }
}
