//! Conflict detection and resolution tests.
//!
//! Each test diverges the local copy and the server between two syncs and
//! checks that nothing is pushed over unseen remote state:
//! 1. A newer patch set blocks pushes until confirmed
//! 2. Overlapping comments park the local comment; disjoint ones merge
//! 3. A change merged elsewhere requires a manual decision
//! 4. Votes merge per label, conflicting labels wait for a decision

mod common;

use common::{comment_at, Harness};
use gerrit_offline::commands;
use gerrit_offline::db::{changes, comments, reviews};
use gerrit_offline::models::{
    ChangeStatus, CommentStatus, ConflictKind, ConflictStatus, OperationStatus, ResolutionStrategy, ReviewStatus,
    SyncType,
};
use gerrit_offline::services::operation_queue;
use gerrit_offline::testing::{remote_change, remote_comment};
use std::collections::BTreeMap;

fn votes(label: &str, value: i32) -> BTreeMap<String, i32> {
    BTreeMap::from([(label.to_string(), value)])
}

/// Test: Scenario C - patch set advances between import and push
///
/// 1. Import a change at patch set 3 and draft a comment
/// 2. The owner uploads patch set 4
/// 3. The next pull flags PatchSetUpdated and nothing is pushed
/// 4. After resolve_conflict the comment is published
#[tokio::test]
async fn test_new_patch_set_blocks_push_until_resolved() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 42, &["App.java"]));
    h.remote.add_patch_set("I1", &["App.java"]);
    h.remote.add_patch_set("I1", &["App.java"]);
    let change = h.import("I1").await;
    assert_eq!(change.current_patch_set_num, 3);

    let comment = commands::create_comment(&h.ctx, comment_at(change.id, "App.java", 20, "Leaks the stream"))
        .await
        .unwrap();

    h.advance(120);
    assert_eq!(h.remote.add_patch_set("I1", &["App.java"]), 4);
    h.advance(60);
    let run = commands::sync_changes(&h.ctx, None, Some(SyncType::Incremental), None)
        .await
        .unwrap();
    assert_eq!(run.conflicts_detected, 1);

    {
        let mut conn = h.ctx.store.acquire().await.unwrap();
        let stored = changes::require(&mut conn, change.id).await.unwrap();
        assert_eq!(stored.conflict_status, ConflictStatus::PatchSetUpdated);
        assert_eq!(stored.current_patch_set_num, 4);
        let entry = &operation_queue::pending_for_comment(&mut conn, comment.id).await.unwrap()[0];
        assert_eq!(entry.status, OperationStatus::Queued);
        assert_eq!(entry.retry_count, 0);
    }
    assert!(h.remote.comments("I1").is_empty());

    // Syncing again does not get past the block.
    commands::sync_changes(&h.ctx, None, Some(SyncType::PushLocal), None)
        .await
        .unwrap();
    assert!(h.remote.comments("I1").is_empty());

    let conflicts = commands::get_conflicts(&h.ctx, Some(change.id)).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::PatchSet);
    commands::resolve_conflict(&h.ctx, conflicts[0].id, ResolutionStrategy::LocalWins)
        .await
        .unwrap();

    commands::sync_changes(&h.ctx, None, Some(SyncType::PushLocal), None)
        .await
        .unwrap();
    let published = h.remote.comments("I1");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].patch_set, 3, "the comment stays on the patch set it was written against");
    let mut conn = h.ctx.store.acquire().await.unwrap();
    assert_eq!(
        changes::require(&mut conn, change.id).await.unwrap().conflict_status,
        ConflictStatus::None
    );
}

/// Test: re-importing a change with queued work
///
/// 1. Import at patch set 3 and draft a comment
/// 2. The owner uploads patch set 4 and the change is imported again
/// 3. The re-import flags PatchSetUpdated, so the next sync pushes nothing
/// 4. After resolve_conflict the comment is published on patch set 3
#[tokio::test]
async fn test_reimport_flags_new_patch_set() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 42, &["App.java"]));
    h.remote.add_patch_set("I1", &["App.java"]);
    h.remote.add_patch_set("I1", &["App.java"]);
    let change = h.import("I1").await;
    commands::create_comment(&h.ctx, comment_at(change.id, "App.java", 20, "Leaks the stream"))
        .await
        .unwrap();

    h.advance(60);
    h.remote.add_patch_set("I1", &["App.java"]);
    let reimported = h.import("I1").await;
    assert_eq!(reimported.id, change.id);
    assert_eq!(reimported.current_patch_set_num, 4);
    assert_eq!(reimported.conflict_status, ConflictStatus::PatchSetUpdated);

    h.advance(60);
    commands::sync_changes(&h.ctx, None, Some(SyncType::Incremental), None)
        .await
        .unwrap();
    assert!(h.remote.comments("I1").is_empty());

    let conflicts = commands::get_conflicts(&h.ctx, Some(change.id)).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::PatchSet);
    commands::resolve_conflict(&h.ctx, conflicts[0].id, ResolutionStrategy::LocalWins)
        .await
        .unwrap();
    commands::sync_changes(&h.ctx, None, Some(SyncType::PushLocal), None)
        .await
        .unwrap();
    let published = h.remote.comments("I1");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].patch_set, 3);
}

/// Test: re-importing with nothing queued raises no conflict
#[tokio::test]
async fn test_reimport_without_local_work_stays_clean() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 42, &["App.java"]));
    h.import("I1").await;

    h.advance(60);
    h.remote.add_patch_set("I1", &["App.java"]);
    let reimported = h.import("I1").await;
    assert_eq!(reimported.current_patch_set_num, 2);
    assert_eq!(reimported.conflict_status, ConflictStatus::None);
    assert!(commands::get_conflicts(&h.ctx, None).await.unwrap().is_empty());
}

/// Test: a server clock behind ours still gets its new patch set pulled
///
/// The server runs five minutes slow, so its timestamps are older than our
/// last sync. The pull must compare server time with server time.
#[tokio::test]
async fn test_lagging_server_clock_still_pulls() {
    let (h, server_clock) = Harness::with_lagging_server(300).await;
    h.add_instance("review").await;
    h.remote.add_change(remote_change("I1", 42, &["App.java"]));
    let change = h.import("I1").await;
    commands::create_comment(&h.ctx, comment_at(change.id, "App.java", 20, "Leaks the stream"))
        .await
        .unwrap();

    h.advance(60);
    server_clock.advance_secs(60);
    h.remote.add_patch_set("I1", &["App.java"]);
    let run = commands::sync_changes(&h.ctx, None, Some(SyncType::Incremental), None)
        .await
        .unwrap();
    assert_eq!(run.conflicts_detected, 1);
    assert!(h.remote.comments("I1").is_empty());

    let mut conn = h.ctx.store.acquire().await.unwrap();
    let stored = changes::require(&mut conn, change.id).await.unwrap();
    assert_eq!(stored.current_patch_set_num, 2);
    assert_eq!(stored.conflict_status, ConflictStatus::PatchSetUpdated);
}

/// Test: RemoteWins on a patch set conflict discards unsent work
#[tokio::test]
async fn test_remote_wins_on_new_patch_set_discards_drafts() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 42, &["App.java"]));
    let change = h.import("I1").await;
    let comment = commands::create_comment(&h.ctx, comment_at(change.id, "App.java", 3, "stale soon"))
        .await
        .unwrap();

    h.advance(60);
    h.remote.add_patch_set("I1", &["App.java"]);
    h.advance(60);
    commands::sync_changes(&h.ctx, None, None, None).await.unwrap();

    let conflict = commands::get_conflicts(&h.ctx, Some(change.id)).await.unwrap()[0].id;
    commands::resolve_conflict(&h.ctx, conflict, ResolutionStrategy::RemoteWins)
        .await
        .unwrap();

    let mut conn = h.ctx.store.acquire().await.unwrap();
    let stored = comments::require(&mut conn, comment.id).await.unwrap();
    assert_eq!(stored.status, CommentStatus::SyncFailed);
    assert!(!operation_queue::has_pending(&mut conn, change.id).await.unwrap());
}

/// Test: overlapping comments
///
/// 1. We draft on line 12; another reviewer comments on line 12 first
/// 2. AutoMerge cannot settle it, so the draft is parked
/// 3. LocalWins publishes ours next to theirs
#[tokio::test]
async fn test_overlapping_comment_waits_for_decision() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 7, &["src/lib.rs"]));
    let change = h.import("I1").await;
    let ours = commands::create_comment(&h.ctx, comment_at(change.id, "src/lib.rs", 12, "use a BTreeMap"))
        .await
        .unwrap();

    h.advance(60);
    h.remote
        .add_comment("I1", remote_comment("r-theirs", 1, "src/lib.rs", Some(12), "use a HashMap"));
    h.advance(60);
    commands::sync_changes(&h.ctx, None, Some(SyncType::Incremental), Some(ResolutionStrategy::AutoMerge))
        .await
        .unwrap();

    {
        let mut conn = h.ctx.store.acquire().await.unwrap();
        assert_eq!(
            comments::require(&mut conn, ours.id).await.unwrap().status,
            CommentStatus::ConflictDetected
        );
        assert_eq!(
            changes::require(&mut conn, change.id).await.unwrap().conflict_status,
            ConflictStatus::CommentsPending
        );
    }
    assert_eq!(h.remote.comments("I1").len(), 1);

    let conflict = commands::get_conflicts(&h.ctx, None).await.unwrap()[0].clone();
    assert_eq!(conflict.kind, ConflictKind::Comment);
    let err = commands::resolve_conflict(&h.ctx, conflict.id, ResolutionStrategy::AutoMerge)
        .await
        .unwrap_err();
    assert!(matches!(err, gerrit_offline::AppError::ValidationError { .. }));

    commands::resolve_conflict(&h.ctx, conflict.id, ResolutionStrategy::LocalWins)
        .await
        .unwrap();
    commands::sync_changes(&h.ctx, None, Some(SyncType::PushLocal), None)
        .await
        .unwrap();

    let published = h.remote.comments("I1");
    assert_eq!(published.len(), 2);
    assert!(published.iter().any(|c| c.message == "use a BTreeMap"));
}

/// Test: comments on disjoint lines merge without a conflict
#[tokio::test]
async fn test_disjoint_comments_auto_merge() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 7, &["src/lib.rs"]));
    let change = h.import("I1").await;
    let ours = commands::create_comment(&h.ctx, comment_at(change.id, "src/lib.rs", 5, "doc comment?"))
        .await
        .unwrap();

    h.advance(60);
    h.remote
        .add_comment("I1", remote_comment("r-far", 1, "src/lib.rs", Some(90), "unused import"));
    h.advance(60);
    let run = commands::sync_changes(&h.ctx, None, None, None).await.unwrap();

    assert_eq!(run.conflicts_detected, 0);
    assert_eq!(h.remote.comments("I1").len(), 2);
    let mut conn = h.ctx.store.acquire().await.unwrap();
    assert_eq!(
        comments::require(&mut conn, ours.id).await.unwrap().status,
        CommentStatus::Synced
    );
    assert_eq!(comments::list_for_change(&mut conn, change.id).await.unwrap().len(), 2);
}

/// Test: change merged elsewhere while a vote is queued
///
/// 1. Queue a vote; the change is merged on the server
/// 2. The pull raises a Status conflict requiring a manual decision
/// 3. RemoteWins drops the vote
#[tokio::test]
async fn test_change_merged_remotely_requires_decision() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 9, &["README.md"]));
    let change = h.import("I1").await;
    let review = commands::update_labels(&h.ctx, change.id, votes("Code-Review", 1))
        .await
        .unwrap();

    h.advance(60);
    h.remote.set_status("I1", ChangeStatus::Merged);
    h.advance(60);
    commands::sync_changes(&h.ctx, None, None, None).await.unwrap();

    {
        let mut conn = h.ctx.store.acquire().await.unwrap();
        let stored = changes::require(&mut conn, change.id).await.unwrap();
        assert_eq!(stored.status, ChangeStatus::Merged);
        assert_eq!(stored.conflict_status, ConflictStatus::ManualResolutionRequired);
    }
    assert!(h.remote.reviews("I1").is_empty());

    let conflict = commands::get_conflicts(&h.ctx, Some(change.id)).await.unwrap()[0].clone();
    assert_eq!(conflict.kind, ConflictKind::Status);
    commands::resolve_conflict(&h.ctx, conflict.id, ResolutionStrategy::RemoteWins)
        .await
        .unwrap();

    let mut conn = h.ctx.store.acquire().await.unwrap();
    assert_eq!(
        reviews::require(&mut conn, review.id).await.unwrap().status,
        ReviewStatus::SubmissionFailed
    );
    assert!(!operation_queue::has_pending(&mut conn, change.id).await.unwrap());
    assert_eq!(
        changes::require(&mut conn, change.id).await.unwrap().conflict_status,
        ConflictStatus::None
    );
}

/// Test: votes on different labels merge; the same label conflicts
#[tokio::test]
async fn test_vote_conflicts_are_per_label() {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 11, &["main.go"]));
    let change = h.import("I1").await;

    // Only we touch Code-Review, only the server touches Verified.
    commands::update_labels(&h.ctx, change.id, votes("Code-Review", 1))
        .await
        .unwrap();
    h.advance(60);
    h.remote.set_vote("I1", "Verified", 1);
    h.advance(60);
    let run = commands::sync_changes(&h.ctx, None, None, None).await.unwrap();
    assert_eq!(run.conflicts_detected, 0);
    assert_eq!(h.remote.reviews("I1").len(), 1);

    // Both sides move Code-Review.
    commands::update_labels(&h.ctx, change.id, votes("Code-Review", 2))
        .await
        .unwrap();
    h.advance(60);
    h.remote.set_vote("I1", "Code-Review", -1);
    h.advance(60);
    commands::sync_changes(&h.ctx, None, None, Some(ResolutionStrategy::ManualResolutionRequired))
        .await
        .unwrap();

    assert_eq!(h.remote.reviews("I1").len(), 1);
    let conflict = commands::get_conflicts(&h.ctx, Some(change.id)).await.unwrap()[0].clone();
    assert_eq!(conflict.kind, ConflictKind::ReviewState);
    {
        let mut conn = h.ctx.store.acquire().await.unwrap();
        assert_eq!(
            changes::require(&mut conn, change.id).await.unwrap().conflict_status,
            ConflictStatus::ManualResolutionRequired
        );
    }

    commands::resolve_conflict(&h.ctx, conflict.id, ResolutionStrategy::LocalWins)
        .await
        .unwrap();
    commands::sync_changes(&h.ctx, None, Some(SyncType::PushLocal), None)
        .await
        .unwrap();

    let posted = h.remote.reviews("I1");
    assert_eq!(posted.len(), 2);
    assert_eq!(posted[1].labels.get("Code-Review"), Some(&2));
    assert_eq!(h.remote.change("I1").unwrap().votes.get("Code-Review"), Some(&2));
}
