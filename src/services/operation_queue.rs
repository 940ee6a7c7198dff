//! Operation queue persistence service.
//!
//! Durable log of local mutations waiting to reach the server. Entries of one
//! change run in submission order: each new entry waits on the latest
//! unfinished entry of its change. Ordering across changes is by priority,
//! then FIFO.

use crate::error::AppError;
use crate::models::{NewOperation, OperationQueueEntry, OperationStatus, OperationType};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

const COLUMNS: &str = "id, change_id, operation_type, payload, priority, status, retry_count, max_retries, \
                       next_retry, depends_on, last_error, created_at, updated_at, completed_at";

/// Retry and batching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePolicy {
    /// Failures beyond this many retries are terminal.
    pub max_retries: i64,
    pub base_backoff_secs: i64,
    pub max_backoff_secs: i64,
    pub batch_size: i64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_secs: 30,
            max_backoff_secs: 3600,
            batch_size: 50,
        }
    }
}

impl QueuePolicy {
    /// Delay before the next attempt of an entry that has already been
    /// retried `retry_count` times: `base · 2^retry_count`, capped.
    pub fn backoff_secs(&self, retry_count: i64) -> i64 {
        let exponent = retry_count.clamp(0, 32) as u32;
        self.base_backoff_secs
            .saturating_mul(1_i64 << exponent)
            .min(self.max_backoff_secs)
    }
}

/// Restricts which entries `next_batch` may return.
#[derive(Debug, Clone, Default)]
pub struct BatchScope {
    pub change_ids: Option<Vec<i64>>,
    pub types: Option<Vec<OperationType>>,
}

impl BatchScope {
    pub fn changes(change_ids: Vec<i64>) -> Self {
        Self {
            change_ids: Some(change_ids),
            types: None,
        }
    }

    pub fn with_types(mut self, types: Vec<OperationType>) -> Self {
        self.types = Some(types);
        self
    }
}

/// Entry counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: i64,
    pub processing: i64,
    pub waiting: i64,
    pub failed: i64,
    pub completed: i64,
    pub cancelled: i64,
}

impl QueueCounts {
    /// Entries that may still reach the server.
    pub fn pending(&self) -> i64 {
        self.queued + self.processing + self.waiting
    }
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Option<OperationQueueEntry>, AppError> {
    let entry = sqlx::query_as::<_, OperationQueueEntry>(&format!(
        "SELECT {COLUMNS} FROM operation_queue WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(entry)
}

pub async fn require(conn: &mut SqliteConnection, id: i64) -> Result<OperationQueueEntry, AppError> {
    get(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("OperationQueueEntry", id))
}

/// Append an operation.
///
/// The entry is `Queued` when its change has no unfinished entry, otherwise
/// `WaitingForDependency` on the latest one.
///
/// # Arguments
/// * `conn` - Connection or transaction; call inside the transaction that
///   writes the local row the operation refers to
/// * `op` - Change, payload and optional priority override
/// * `policy` - Supplies `max_retries`
/// * `now` - Current Unix time
pub async fn enqueue(
    conn: &mut SqliteConnection,
    op: &NewOperation,
    policy: &QueuePolicy,
    now: i64,
) -> Result<OperationQueueEntry, AppError> {
    let predecessor: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM operation_queue
        WHERE change_id = ? AND status IN ('queued', 'processing', 'waiting_for_dependency')
        ORDER BY id DESC LIMIT 1
        "#,
    )
    .bind(op.change_id)
    .fetch_optional(&mut *conn)
    .await?;

    let status = if predecessor.is_some() {
        OperationStatus::WaitingForDependency
    } else {
        OperationStatus::Queued
    };
    let priority = op.priority.unwrap_or_else(|| op.payload.default_priority());

    let entry = sqlx::query_as::<_, OperationQueueEntry>(&format!(
        r#"
        INSERT INTO operation_queue (change_id, operation_type, payload, priority, status, retry_count,
            max_retries, depends_on, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(op.change_id)
    .bind(op.payload.operation_type())
    .bind(sqlx::types::Json(&op.payload))
    .bind(priority)
    .bind(status)
    .bind(policy.max_retries)
    .bind(predecessor)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    log::debug!(
        "Enqueued {} #{} for change {} ({})",
        entry.operation_type,
        entry.id,
        entry.change_id,
        entry.status
    );

    Ok(entry)
}

/// Ready entries: `Queued`, due, on a change without open conflicts, in
/// priority then FIFO order.
pub async fn next_batch(
    conn: &mut SqliteConnection,
    limit: i64,
    now: i64,
    scope: &BatchScope,
) -> Result<Vec<OperationQueueEntry>, AppError> {
    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        r#"
        SELECT {COLUMNS} FROM operation_queue
        WHERE status = 'queued'
          AND (next_retry IS NULL OR next_retry <= "#
    ));
    query.push_bind(now);
    query.push(") AND change_id IN (SELECT id FROM changes WHERE conflict_status = 'none')");

    if let Some(change_ids) = &scope.change_ids {
        if change_ids.is_empty() {
            return Ok(Vec::new());
        }
        query.push(" AND change_id IN (");
        let mut separated = query.separated(", ");
        for id in change_ids {
            separated.push_bind(*id);
        }
        query.push(")");
    }

    if let Some(types) = &scope.types {
        if types.is_empty() {
            return Ok(Vec::new());
        }
        query.push(" AND operation_type IN (");
        let mut separated = query.separated(", ");
        for t in types {
            separated.push_bind(*t);
        }
        query.push(")");
    }

    query.push(" ORDER BY priority DESC, id ASC LIMIT ");
    query.push_bind(limit);

    let entries = query
        .build_query_as::<OperationQueueEntry>()
        .fetch_all(&mut *conn)
        .await?;
    Ok(entries)
}

/// Claim a `Queued` entry. Returns `false` if it is no longer queued.
pub async fn mark_processing(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<bool, AppError> {
    let result = sqlx::query(
        "UPDATE operation_queue SET status = 'processing', updated_at = ? WHERE id = ? AND status = 'queued'",
    )
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn promote_dependents(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<u64, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE operation_queue SET status = 'queued', updated_at = ?
        WHERE depends_on = ? AND status = 'waiting_for_dependency'
        "#,
    )
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Record confirmed remote success and release dependents.
pub async fn mark_completed(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<(), AppError> {
    let result = sqlx::query(
        r#"
        UPDATE operation_queue SET status = 'completed', completed_at = ?, updated_at = ?, last_error = NULL,
            next_retry = NULL
        WHERE id = ? AND status IN ('queued', 'processing', 'waiting_for_dependency')
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found_with_id("OperationQueueEntry", id));
    }

    promote_dependents(conn, id, now).await?;
    Ok(())
}

/// Return a `Processing` entry to `Queued` without consuming a retry.
pub async fn release(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE operation_queue SET status = 'queued', updated_at = ? WHERE id = ? AND status = 'processing'",
    )
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Record a failed attempt.
///
/// Increments `retry_count`. A non-retryable error, or a count above
/// `max_retries`, makes the entry terminal `Failed` (its dependents are
/// released). Otherwise it is re-queued with exponential backoff.
///
/// # Returns
/// The entry's new status
pub async fn mark_failed(
    conn: &mut SqliteConnection,
    id: i64,
    error: &str,
    retryable: bool,
    policy: &QueuePolicy,
    now: i64,
) -> Result<OperationStatus, AppError> {
    let entry = require(conn, id).await?;
    let retry_count = entry.retry_count + 1;
    let terminal = !retryable || retry_count > entry.max_retries;

    if terminal {
        sqlx::query(
            r#"
            UPDATE operation_queue SET status = 'failed', retry_count = ?, last_error = ?, next_retry = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(retry_count)
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;

        promote_dependents(conn, id, now).await?;
        log::warn!(
            "Operation #{} ({}) failed permanently after {} attempt(s): {}",
            id,
            entry.operation_type,
            retry_count,
            error
        );
        return Ok(OperationStatus::Failed);
    }

    let next_retry = now + policy.backoff_secs(entry.retry_count);
    sqlx::query(
        r#"
        UPDATE operation_queue SET status = 'queued', retry_count = ?, last_error = ?, next_retry = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(retry_count)
    .bind(error)
    .bind(next_retry)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    log::info!(
        "Operation #{} ({}) will retry at {} (attempt {}): {}",
        id,
        entry.operation_type,
        next_retry,
        retry_count,
        error
    );
    Ok(OperationStatus::Queued)
}

/// Cancel an entry that is not in flight.
///
/// Entries waiting on it inherit its own dependency when that is still
/// unfinished, and are queued otherwise.
pub async fn cancel(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<(), AppError> {
    let entry = require(conn, id).await?;
    match entry.status {
        OperationStatus::Queued | OperationStatus::WaitingForDependency | OperationStatus::Failed => {}
        OperationStatus::Processing => {
            return Err(AppError::validation("Operation is being processed"));
        }
        OperationStatus::Completed | OperationStatus::Cancelled => return Ok(()),
    }

    sqlx::query("UPDATE operation_queue SET status = 'cancelled', next_retry = NULL, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    let inherited = match entry.depends_on {
        Some(dep) => get(conn, dep)
            .await?
            .filter(|d| d.status.is_unfinished())
            .map(|d| d.id),
        None => None,
    };

    match inherited {
        Some(dep) => {
            sqlx::query(
                r#"
                UPDATE operation_queue SET depends_on = ?, updated_at = ?
                WHERE depends_on = ? AND status = 'waiting_for_dependency'
                "#,
            )
            .bind(dep)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        }
        None => {
            promote_dependents(conn, id, now).await?;
        }
    }

    Ok(())
}

/// Cancel every unfinished entry of a change, optionally limited to those
/// referencing one comment. Returns the number cancelled.
pub async fn cancel_for_change(
    conn: &mut SqliteConnection,
    change_id: i64,
    comment_id: Option<i64>,
    now: i64,
) -> Result<usize, AppError> {
    let entries = entries_for_change(conn, change_id).await?;
    let mut cancelled = 0;
    // Newest first so no survivor is left waiting on a cancelled entry.
    for entry in entries.iter().rev() {
        if !matches!(entry.status, OperationStatus::Queued | OperationStatus::WaitingForDependency) {
            continue;
        }
        if comment_id.is_some() && entry.payload.comment_id() != comment_id {
            continue;
        }
        cancel(conn, entry.id, now).await?;
        cancelled += 1;
    }
    Ok(cancelled)
}

/// Manually reset a terminal failure for another attempt.
pub async fn retry(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<(), AppError> {
    let result = sqlx::query(
        r#"
        UPDATE operation_queue SET status = 'queued', retry_count = 0, next_retry = NULL, last_error = NULL,
            updated_at = ?
        WHERE id = ? AND status = 'failed'
        "#,
    )
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found_with_id("FailedOperation", id));
    }
    Ok(())
}

/// Delete completed and cancelled entries finished before `older_than`.
pub async fn purge_completed(conn: &mut SqliteConnection, older_than: i64) -> Result<u64, AppError> {
    let result = sqlx::query(
        r#"
        DELETE FROM operation_queue
        WHERE status IN ('completed', 'cancelled') AND updated_at < ?
          AND id NOT IN (
              SELECT depends_on FROM operation_queue
              WHERE depends_on IS NOT NULL AND status = 'waiting_for_dependency'
          )
        "#,
    )
    .bind(older_than)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Counts by status, for one instance or all.
pub async fn counts(conn: &mut SqliteConnection, instance_id: Option<i64>) -> Result<QueueCounts, AppError> {
    let rows: Vec<(OperationStatus, i64)> = sqlx::query_as(
        r#"
        SELECT q.status, COUNT(*) FROM operation_queue q
        JOIN changes c ON c.id = q.change_id
        WHERE ? IS NULL OR c.instance_id = ?
        GROUP BY q.status
        "#,
    )
    .bind(instance_id)
    .bind(instance_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut counts = QueueCounts::default();
    for (status, n) in rows {
        match status {
            OperationStatus::Queued => counts.queued = n,
            OperationStatus::Processing => counts.processing = n,
            OperationStatus::WaitingForDependency => counts.waiting = n,
            OperationStatus::Failed => counts.failed = n,
            OperationStatus::Completed => counts.completed = n,
            OperationStatus::Cancelled => counts.cancelled = n,
        }
    }
    Ok(counts)
}

/// Terminal failures awaiting a user decision.
pub async fn failed_entries(
    conn: &mut SqliteConnection,
    instance_id: i64,
) -> Result<Vec<OperationQueueEntry>, AppError> {
    let entries = sqlx::query_as::<_, OperationQueueEntry>(&format!(
        r#"
        SELECT {COLUMNS} FROM operation_queue
        WHERE status = 'failed' AND change_id IN (SELECT id FROM changes WHERE instance_id = ?)
        ORDER BY id
        "#
    ))
    .bind(instance_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(entries)
}

pub async fn entries_for_change(
    conn: &mut SqliteConnection,
    change_id: i64,
) -> Result<Vec<OperationQueueEntry>, AppError> {
    let entries = sqlx::query_as::<_, OperationQueueEntry>(&format!(
        "SELECT {COLUMNS} FROM operation_queue WHERE change_id = ? ORDER BY id"
    ))
    .bind(change_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(entries)
}

/// Whether the change has entries that may still reach the server.
pub async fn has_pending(conn: &mut SqliteConnection, change_id: i64) -> Result<bool, AppError> {
    let n: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM operation_queue
        WHERE change_id = ? AND status IN ('queued', 'processing', 'waiting_for_dependency')
        "#,
    )
    .bind(change_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(n > 0)
}

/// Unfinished entries referencing a comment.
pub async fn pending_for_comment(
    conn: &mut SqliteConnection,
    comment_id: i64,
) -> Result<Vec<OperationQueueEntry>, AppError> {
    let entries = sqlx::query_as::<_, OperationQueueEntry>(&format!(
        r#"
        SELECT {COLUMNS} FROM operation_queue
        WHERE json_extract(payload, '$.comment_id') = ?
          AND status IN ('queued', 'processing', 'waiting_for_dependency')
        ORDER BY id
        "#
    ))
    .bind(comment_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(entries)
}

/// Return entries a crash left `Processing` to `Queued`.
pub async fn recover_interrupted(conn: &mut SqliteConnection, now: i64) -> Result<u64, AppError> {
    let result = sqlx::query("UPDATE operation_queue SET status = 'queued', updated_at = ? WHERE status = 'processing'")
        .bind(now)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() > 0 {
        log::info!("Recovered {} interrupted operation(s)", result.rows_affected());
    }
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures;
    use crate::models::{Change, OperationPayload, Priority};

    async fn setup() -> (tempfile::TempDir, crate::db::Store, Change) {
        let (dir, store) = fixtures::open_store().await;
        let mut conn = store.acquire().await.unwrap();
        let (change, _) = fixtures::change_with_patch_set(&mut conn).await;
        drop(conn);
        (dir, store, change)
    }

    fn add(change_id: i64, comment_id: i64) -> NewOperation {
        NewOperation::new(change_id, OperationPayload::AddComment { comment_id })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = QueuePolicy::default();
        assert_eq!(policy.backoff_secs(0), 30);
        assert_eq!(policy.backoff_secs(1), 60);
        assert_eq!(policy.backoff_secs(2), 120);
        assert_eq!(policy.backoff_secs(20), 3600);
        assert_eq!(policy.backoff_secs(1000), 3600);
    }

    #[tokio::test]
    async fn test_entries_of_a_change_chain_in_order() {
        let (_dir, store, change) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        let policy = QueuePolicy::default();

        let first = enqueue(&mut conn, &add(change.id, 1), &policy, 0).await.unwrap();
        let review = enqueue(
            &mut conn,
            &NewOperation::new(change.id, OperationPayload::SubmitReview { review_id: 1 }),
            &policy,
            0,
        )
        .await
        .unwrap();

        assert_eq!(first.status, OperationStatus::Queued);
        assert_eq!(review.status, OperationStatus::WaitingForDependency);
        assert_eq!(review.depends_on, Some(first.id));

        let batch = next_batch(&mut conn, 10, 0, &BatchScope::default()).await.unwrap();
        assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![first.id]);

        assert!(mark_processing(&mut conn, first.id, 1).await.unwrap());
        mark_completed(&mut conn, first.id, 2).await.unwrap();

        let batch = next_batch(&mut conn, 10, 2, &BatchScope::default()).await.unwrap();
        assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![review.id]);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_across_changes() {
        let (_dir, store, change) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        let other = crate::db::changes::upsert_importing(&mut conn, change.instance_id, &fixtures::metadata("I2"), 0)
            .await
            .unwrap();
        let third = crate::db::changes::upsert_importing(&mut conn, change.instance_id, &fixtures::metadata("I3"), 0)
            .await
            .unwrap();
        let policy = QueuePolicy::default();

        let normal = enqueue(&mut conn, &add(change.id, 1), &policy, 0).await.unwrap();
        let mut urgent = add(other.id, 2);
        urgent.priority = Some(Priority::Critical);
        let urgent = enqueue(&mut conn, &urgent, &policy, 0).await.unwrap();
        let low = enqueue(
            &mut conn,
            &NewOperation::new(
                third.id,
                OperationPayload::DeleteComment {
                    comment_id: 3,
                    remote_id: "r3".into(),
                },
            ),
            &policy,
            0,
        )
        .await
        .unwrap();

        let batch = next_batch(&mut conn, 10, 0, &BatchScope::default()).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![urgent.id, normal.id, low.id]);

        let scoped = next_batch(&mut conn, 10, 0, &BatchScope::changes(vec![change.id])).await.unwrap();
        assert_eq!(scoped.len(), 1);

        let typed = next_batch(
            &mut conn,
            10,
            0,
            &BatchScope::default().with_types(vec![OperationType::DeleteComment]),
        )
        .await
        .unwrap();
        assert_eq!(typed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![low.id]);
    }

    #[tokio::test]
    async fn test_conflicted_change_is_excluded() {
        let (_dir, store, change) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        enqueue(&mut conn, &add(change.id, 1), &QueuePolicy::default(), 0).await.unwrap();

        crate::db::changes::set_conflict_status(
            &mut conn,
            change.id,
            crate::models::ConflictStatus::PatchSetUpdated,
            0,
        )
        .await
        .unwrap();

        assert!(next_batch(&mut conn, 10, 0, &BatchScope::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_backoff_then_terminal() {
        let (_dir, store, change) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        let policy = QueuePolicy::default();
        let entry = enqueue(&mut conn, &add(change.id, 1), &policy, 0).await.unwrap();

        let mut now = 100;
        for attempt in 1..=3 {
            assert!(mark_processing(&mut conn, entry.id, now).await.unwrap());
            let status = mark_failed(&mut conn, entry.id, "timeout", true, &policy, now).await.unwrap();
            assert_eq!(status, OperationStatus::Queued);

            let reloaded = require(&mut conn, entry.id).await.unwrap();
            assert_eq!(reloaded.retry_count, attempt);
            let due = reloaded.next_retry.unwrap();
            assert_eq!(due, now + policy.backoff_secs(attempt - 1));
            assert!(next_batch(&mut conn, 10, due - 1, &BatchScope::default()).await.unwrap().is_empty());
            now = due;
        }

        assert!(mark_processing(&mut conn, entry.id, now).await.unwrap());
        let status = mark_failed(&mut conn, entry.id, "timeout", true, &policy, now).await.unwrap();
        assert_eq!(status, OperationStatus::Failed);
        assert!(next_batch(&mut conn, 10, i64::MAX, &BatchScope::default()).await.unwrap().is_empty());
        assert_eq!(counts(&mut conn, Some(change.instance_id)).await.unwrap().failed, 1);

        retry(&mut conn, entry.id, now).await.unwrap();
        let retried = require(&mut conn, entry.id).await.unwrap();
        assert_eq!(retried.status, OperationStatus::Queued);
        assert_eq!(retried.retry_count, 0);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_terminal_and_releases_dependents() {
        let (_dir, store, change) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        let policy = QueuePolicy::default();
        let first = enqueue(&mut conn, &add(change.id, 1), &policy, 0).await.unwrap();
        let second = enqueue(&mut conn, &add(change.id, 2), &policy, 0).await.unwrap();

        mark_processing(&mut conn, first.id, 1).await.unwrap();
        let status = mark_failed(&mut conn, first.id, "bad request", false, &policy, 1).await.unwrap();
        assert_eq!(status, OperationStatus::Failed);
        assert_eq!(require(&mut conn, second.id).await.unwrap().status, OperationStatus::Queued);
    }

    #[tokio::test]
    async fn test_release_keeps_retry_budget() {
        let (_dir, store, change) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        let entry = enqueue(&mut conn, &add(change.id, 1), &QueuePolicy::default(), 0).await.unwrap();

        mark_processing(&mut conn, entry.id, 1).await.unwrap();
        release(&mut conn, entry.id, 2).await.unwrap();

        let released = require(&mut conn, entry.id).await.unwrap();
        assert_eq!(released.status, OperationStatus::Queued);
        assert_eq!(released.retry_count, 0);
        assert!(released.next_retry.is_none());
    }

    #[tokio::test]
    async fn test_cancel_passes_dependency_down_the_chain() {
        let (_dir, store, change) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        let policy = QueuePolicy::default();
        let a = enqueue(&mut conn, &add(change.id, 1), &policy, 0).await.unwrap();
        let b = enqueue(&mut conn, &add(change.id, 2), &policy, 0).await.unwrap();
        let c = enqueue(&mut conn, &add(change.id, 3), &policy, 0).await.unwrap();

        cancel(&mut conn, b.id, 1).await.unwrap();
        let c_after = require(&mut conn, c.id).await.unwrap();
        assert_eq!(c_after.status, OperationStatus::WaitingForDependency);
        assert_eq!(c_after.depends_on, Some(a.id));

        cancel(&mut conn, a.id, 2).await.unwrap();
        assert_eq!(require(&mut conn, c.id).await.unwrap().status, OperationStatus::Queued);

        assert_eq!(pending_for_comment(&mut conn, 3).await.unwrap().len(), 1);
        assert_eq!(cancel_for_change(&mut conn, change.id, Some(3), 3).await.unwrap(), 1);
        assert!(!has_pending(&mut conn, change.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_and_purge() {
        let (_dir, store, change) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        let policy = QueuePolicy::default();
        let a = enqueue(&mut conn, &add(change.id, 1), &policy, 0).await.unwrap();
        mark_processing(&mut conn, a.id, 1).await.unwrap();

        assert_eq!(recover_interrupted(&mut conn, 2).await.unwrap(), 1);
        assert_eq!(require(&mut conn, a.id).await.unwrap().status, OperationStatus::Queued);

        mark_completed(&mut conn, a.id, 3).await.unwrap();
        assert_eq!(purge_completed(&mut conn, 3).await.unwrap(), 0);
        assert_eq!(purge_completed(&mut conn, 4).await.unwrap(), 1);
        assert!(get(&mut conn, a.id).await.unwrap().is_none());
    }
}
