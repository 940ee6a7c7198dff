//! Retry and cancellation tests for the operation queue.
//!
//! Time is driven by the harness's manual clock, so backoff windows are
//! crossed by advancing it rather than sleeping.

mod common;

use common::{comment_at, eventually, Harness};
use gerrit_offline::commands;
use gerrit_offline::db::comments;
use gerrit_offline::models::{CommentStatus, OperationQueueEntry, OperationStatus, SyncRunState, SyncType};
use gerrit_offline::services::operation_queue;
use gerrit_offline::testing::{remote_change, FakeFailure};

async fn entry_of(h: &Harness, comment_id: i64) -> OperationQueueEntry {
    let mut conn = h.ctx.store.acquire().await.unwrap();
    let change_id = comments::require(&mut conn, comment_id).await.unwrap().change_id;
    operation_queue::entries_for_change(&mut conn, change_id)
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap()
}

async fn push(h: &Harness) {
    commands::sync_changes(&h.ctx, None, Some(SyncType::PushLocal), None)
        .await
        .unwrap();
}

/// Test: Scenario D - server times out on every attempt
///
/// 1. Attempts back off 30s, 60s, 120s
/// 2. A sync inside the backoff window does not retry
/// 3. The fourth failure is terminal and the comment is marked failed
/// 4. The failed entry is reported by get_sync_status
#[tokio::test]
async fn test_timeouts_back_off_then_fail() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 3, &["Main.java"]));
    let change = h.import("I1").await;
    let comment = commands::create_comment(&h.ctx, comment_at(change.id, "Main.java", 147, "Null check"))
        .await
        .unwrap();
    h.remote.fail_always("post_comment", FakeFailure::Timeout);

    push(&h).await;
    let entry = entry_of(&h, comment.id).await;
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.status, OperationStatus::Queued);
    assert_eq!(entry.next_retry, Some(h.ctx.now() + 30));
    assert!(entry.last_error.is_some());

    // Not due yet.
    h.advance(10);
    push(&h).await;
    assert_eq!(h.remote.call_count("post_comment"), 1);
    assert_eq!(entry_of(&h, comment.id).await.retry_count, 1);

    h.advance(20);
    push(&h).await;
    let entry = entry_of(&h, comment.id).await;
    assert_eq!(entry.retry_count, 2);
    assert_eq!(entry.next_retry, Some(h.ctx.now() + 60));

    h.advance(60);
    push(&h).await;
    let entry = entry_of(&h, comment.id).await;
    assert_eq!(entry.retry_count, 3);
    assert_eq!(entry.next_retry, Some(h.ctx.now() + 120));

    h.advance(120);
    push(&h).await;
    let entry = entry_of(&h, comment.id).await;
    assert_eq!(entry.retry_count, 4);
    assert_eq!(entry.status, OperationStatus::Failed);
    assert_eq!(h.remote.call_count("post_comment"), 4);

    {
        let mut conn = h.ctx.store.acquire().await.unwrap();
        assert_eq!(
            comments::require(&mut conn, comment.id).await.unwrap().status,
            CommentStatus::SyncFailed
        );
    }
    let status = commands::get_sync_status(&h.ctx).await.unwrap();
    assert_eq!(status.failed_operations.len(), 1);
    assert_eq!(status.failed_operations[0].id, entry.id);

    // Terminal entries are never picked up again.
    h.advance(3600);
    push(&h).await;
    assert_eq!(h.remote.call_count("post_comment"), 4);
}

/// Test: a rejected request fails at once without retries
#[tokio::test]
async fn test_client_error_is_not_retried() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 3, &["Main.java"]));
    let change = h.import("I1").await;
    let comment = commands::create_comment(&h.ctx, comment_at(change.id, "Main.java", 1, "nit"))
        .await
        .unwrap();
    h.remote.fail_next("post_comment", FakeFailure::Status(400));

    push(&h).await;

    let entry = entry_of(&h, comment.id).await;
    assert_eq!(entry.status, OperationStatus::Failed);
    assert_eq!(entry.retry_count, 1);
}

/// Test: the server recovers inside the retry budget
#[tokio::test]
async fn test_transient_failure_then_success() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 3, &["Main.java"]));
    let change = h.import("I1").await;
    let comment = commands::create_comment(&h.ctx, comment_at(change.id, "Main.java", 9, "rename"))
        .await
        .unwrap();
    h.remote.fail_times("post_comment", FakeFailure::Status(503), 2);

    push(&h).await;
    h.advance(30);
    push(&h).await;
    h.advance(60);
    push(&h).await;

    let entry = entry_of(&h, comment.id).await;
    assert_eq!(entry.status, OperationStatus::Completed);
    assert_eq!(h.remote.comments("I1").len(), 1);
}

/// Test: cancelling a run mid-request
///
/// 1. post_comment never answers
/// 2. cancel_sync ends the run as Cancelled
/// 3. The entry is queued again without spending a retry
#[tokio::test]
async fn test_cancel_releases_in_flight_entry() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 3, &["Main.java"]));
    let change = h.import("I1").await;
    let comment = commands::create_comment(&h.ctx, comment_at(change.id, "Main.java", 2, "hang"))
        .await
        .unwrap();
    h.remote.fail_next("post_comment", FakeFailure::Hang);

    let ctx = h.ctx.clone();
    let run = tokio::spawn(async move { commands::sync_changes(&ctx, None, Some(SyncType::PushLocal), None).await });

    let remote = h.remote.clone();
    assert!(
        eventually(|| {
            let remote = remote.clone();
            async move { remote.call_count("post_comment") == 1 }
        })
        .await
    );
    assert!(commands::cancel_sync(&h.ctx).await.unwrap());

    let run = run.await.unwrap().unwrap();
    assert_eq!(run.state, SyncRunState::Cancelled);
    let entry = entry_of(&h, comment.id).await;
    assert_eq!(entry.status, OperationStatus::Queued);
    assert_eq!(entry.retry_count, 0);
    assert!(!commands::get_sync_status(&h.ctx).await.unwrap().is_running);

    // The next run delivers it.
    push(&h).await;
    assert_eq!(h.remote.comments("I1").len(), 1);
}
