//! Offline workflow verification tests.
//!
//! These tests verify the offline-first contract end to end:
//! - Import a change once while online
//! - Browse, comment, reply and vote without touching the server
//! - Publish everything with one sync once the server is reachable
//!
//! All reads come from the local SQLite store and all writes go to the
//! operation queue; only `sync_changes` talks to the server.

mod common;

use common::{comment_at, Harness};
use gerrit_offline::commands::{self, reviews::SubmitReviewInput};
use gerrit_offline::db::comments;
use gerrit_offline::models::{CommentStatus, ImportStatus, OperationStatus, OperationType, ReviewStatus, SyncType};
use gerrit_offline::services::operation_queue;
use gerrit_offline::testing::remote_change;
use std::collections::BTreeMap;

/// Test: Scenario A - importing a large change
///
/// 1. Server has change #12345 with 127 files
/// 2. Import it
/// 3. The local copy is complete and nothing is reviewed yet
#[tokio::test]
async fn test_import_change_with_127_files() {
    let (h, _instance) = Harness::with_instance().await;
    let paths: Vec<String> = (0..127).map(|i| format!("src/main/java/Module{:03}.java", i)).collect();
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    h.remote.add_change(remote_change("I12345", 12345, &refs));

    let change = h.import("I12345").await;

    assert_eq!(change.number, 12345);
    assert_eq!(change.import_status, ImportStatus::Imported);
    assert_eq!(change.total_files, 127);
    assert_eq!(change.reviewed_files, 0);
    assert_eq!(change.total_comments, 0);

    let detail = commands::get_change(&h.ctx, change.id).await.unwrap();
    assert_eq!(detail.files.len(), 127);
    assert_eq!(detail.patch_sets.iter().filter(|ps| ps.is_current).count(), 1);
}

/// Test: Scenario B - comment offline, publish on sync
///
/// 1. Comment on Main.java line 147 while offline
/// 2. Comment is LocalOnly with exactly one AddComment entry queued
/// 3. Sync succeeds
/// 4. Comment is Synced and the entry Completed
#[tokio::test]
async fn test_offline_comment_published_by_sync() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 501, &["Main.java"]));
    let change = h.import("I1").await;
    let calls_after_import = h.remote.calls().len();

    let comment = commands::create_comment(&h.ctx, comment_at(change.id, "Main.java", 147, "Null check missing"))
        .await
        .unwrap();

    assert_eq!(comment.status, CommentStatus::LocalOnly);
    assert_eq!(h.remote.calls().len(), calls_after_import, "drafting must not contact the server");
    let entries = {
        let mut conn = h.ctx.store.acquire().await.unwrap();
        operation_queue::entries_for_change(&mut conn, change.id).await.unwrap()
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation_type, OperationType::AddComment);
    assert_eq!(entries[0].status, OperationStatus::Queued);

    h.advance(60);
    commands::sync_changes(&h.ctx, None, Some(SyncType::Incremental), None)
        .await
        .unwrap();

    let mut conn = h.ctx.store.acquire().await.unwrap();
    let synced = comments::require(&mut conn, comment.id).await.unwrap();
    assert_eq!(synced.status, CommentStatus::Synced);
    let remote_id = synced.remote_id.clone().unwrap();
    let entry = operation_queue::require(&mut conn, entries[0].id).await.unwrap();
    assert_eq!(entry.status, OperationStatus::Completed);

    let published = h.remote.comments("I1");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].id, remote_id);
    assert_eq!(published[0].line, Some(147));
    assert_eq!(published[0].message, "Null check missing");
}

/// Test: a full offline review session
///
/// 1. Mark files reviewed, reply to a reviewer, vote
/// 2. One sync publishes the reply before the review that references it
#[tokio::test]
async fn test_offline_review_session() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I7", 700, &["lib.rs", "main.rs"]));
    h.remote.add_comment(
        "I7",
        gerrit_offline::testing::remote_comment("r-q", 1, "lib.rs", Some(10), "Why clone here?"),
    );
    let change = h.import("I7").await;

    commands::mark_file_reviewed(&h.ctx, change.id, "lib.rs", true).await.unwrap();
    let updated = commands::mark_file_reviewed(&h.ctx, change.id, "main.rs", true).await.unwrap();
    assert_eq!(updated.reviewed_files, 2);
    assert_eq!(updated.total_files, 2);

    let threads = commands::get_comment_threads(&h.ctx, change.id).await.unwrap();
    let root = threads.roots().next().unwrap().clone();
    assert_eq!(root.remote_id.as_deref(), Some("r-q"));

    let reply = commands::reply_to_comment(&h.ctx, root.id, "Borrow checker; will fix.", Some(false))
        .await
        .unwrap();
    let review = commands::submit_review(
        &h.ctx,
        SubmitReviewInput {
            change_id: change.id,
            patch_set: None,
            message: "Thanks!".into(),
            labels: BTreeMap::from([("Code-Review".to_string(), 1)]),
        },
    )
    .await
    .unwrap();
    assert_eq!(review.comment_ids, vec![reply.id]);

    h.advance(30);
    commands::sync_changes(&h.ctx, None, Some(SyncType::PushLocal), None)
        .await
        .unwrap();

    let published = h.remote.comments("I7");
    let posted_reply = published.iter().find(|c| c.id != "r-q").unwrap();
    assert_eq!(posted_reply.in_reply_to.as_deref(), Some("r-q"));
    let reviews = h.remote.reviews("I7");
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].labels.get("Code-Review"), Some(&1));

    let stored = commands::list_reviews(&h.ctx, change.id).await.unwrap();
    assert_eq!(stored[0].status, ReviewStatus::Submitted);
    let mut conn = h.ctx.store.acquire().await.unwrap();
    let local_change = gerrit_offline::db::changes::require(&mut conn, change.id).await.unwrap();
    assert_eq!(local_change.extensions.baseline_votes.get("Code-Review"), Some(&1));
}
