//! Background sync loop tests.
//!
//! The loop sleeps on the injected clock, so each test moves the manual
//! clock forward and polls for the effect.

mod common;

use common::{comment_at, eventually, Harness};
use gerrit_offline::commands;
use gerrit_offline::testing::remote_change;
use gerrit_offline::SyncEngine;

async fn harness_with_draft() -> Harness {
    let (h, _instance) = Harness::with_instance().await;
    h.remote.add_change(remote_change("I1", 1, &["a.rs"]));
    let change = h.import("I1").await;
    commands::create_comment(&h.ctx, comment_at(change.id, "a.rs", 8, "queued"))
        .await
        .unwrap();
    h
}

fn disable_polling(h: &Harness) {
    let mut settings = h.ctx.settings();
    settings.sync.background_enabled = false;
    h.ctx.set_settings(settings);
}

/// Test: the loop publishes queued work once its first deadline passes
#[tokio::test]
async fn test_background_loop_flushes_queue() {
    let h = harness_with_draft().await;
    let handle = SyncEngine::start_background(h.ctx.clone());

    let remote = h.remote.clone();
    let clock = h.clock.clone();
    let published = eventually(|| {
        let remote = remote.clone();
        let clock = clock.clone();
        async move {
            clock.advance_secs(5);
            remote.comments("I1").len() == 1
        }
    })
    .await;
    assert!(published);
    assert_eq!(handle.interval_secs(), 300);

    handle.stop().await.unwrap();
}

/// Test: a manual trigger runs a sync without waiting for the interval
#[tokio::test]
async fn test_trigger_sync_runs_immediately() {
    let h = harness_with_draft().await;
    disable_polling(&h);
    let handle = SyncEngine::start_background(h.ctx.clone());

    handle.trigger_sync().await.unwrap();

    let remote = h.remote.clone();
    assert!(
        eventually(|| {
            let remote = remote.clone();
            async move { remote.comments("I1").len() == 1 }
        })
        .await
    );
    handle.stop().await.unwrap();
}

/// Test: regaining connectivity flushes the queue
#[tokio::test]
async fn test_reconnect_flushes_queue() {
    let h = harness_with_draft().await;
    disable_polling(&h);
    let handle = SyncEngine::start_background(h.ctx.clone());

    handle.reconnected().await.unwrap();

    let remote = h.remote.clone();
    assert!(
        eventually(|| {
            let remote = remote.clone();
            async move { remote.comments("I1").len() == 1 }
        })
        .await
    );
    handle.stop().await.unwrap();
}

/// Test: polling disabled means nothing runs however much time passes
#[tokio::test]
async fn test_disabled_polling_never_syncs() {
    let h = harness_with_draft().await;
    disable_polling(&h);
    let handle = SyncEngine::start_background(h.ctx.clone());

    for _ in 0..20 {
        h.advance(600);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    assert!(h.remote.comments("I1").is_empty());
    assert_eq!(h.remote.call_count("post_comment"), 0);
    handle.stop().await.unwrap();
}

/// Test: the interval is clamped and the loop stops on request
#[tokio::test]
async fn test_set_interval_and_stop() {
    let h = harness_with_draft().await;
    disable_polling(&h);
    let handle = SyncEngine::start_background(h.ctx.clone());

    handle.set_interval(5).await.unwrap();
    let watcher = handle.clone();
    assert!(
        eventually(|| {
            let watcher = watcher.clone();
            async move { watcher.interval_secs() == 60 }
        })
        .await
    );

    handle.set_interval(86_400).await.unwrap();
    let watcher = handle.clone();
    assert!(
        eventually(|| {
            let watcher = watcher.clone();
            async move { watcher.interval_secs() == 3600 }
        })
        .await
    );

    handle.stop().await.unwrap();
    let watcher = handle.clone();
    assert!(
        eventually(|| {
            let watcher = watcher.clone();
            async move { watcher.trigger_sync().await.is_err() }
        })
        .await
    );
}
