//! Shared setup for the integration tests.
//!
//! Every test gets its own database file, in-memory server and manual clock,
//! so tests run side by side without sharing state.

#![allow(dead_code)]

use gerrit_offline::clock::{Clock, ManualClock};
use gerrit_offline::commands::{self, comments::CreateCommentInput};
use gerrit_offline::db::Store;
use gerrit_offline::models::{Change, CreateInstanceInput, Instance};
use gerrit_offline::testing::{FakeConnector, FakeRemote, PassthroughVault};
use gerrit_offline::AppContext;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

/// 2023-11-14T22:13:20Z
pub const START: i64 = 1_700_000_000;

pub struct Harness {
    pub dir: TempDir,
    pub ctx: AppContext,
    pub remote: Arc<FakeRemote>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::at_unix(START));
        let remote = FakeRemote::with_clock(clock.clone());
        let ctx = context_at(&db_path(&dir), &remote, &clock).await;
        Self {
            dir,
            ctx,
            remote,
            clock,
        }
    }

    /// A harness whose server clock runs `lag` seconds behind ours.
    ///
    /// [`Harness::advance`] only moves our clock; the server's is returned.
    pub async fn with_lagging_server(lag: i64) -> (Self, Arc<ManualClock>) {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::at_unix(START));
        let server_clock = Arc::new(ManualClock::at_unix(START - lag));
        let remote = FakeRemote::with_clock(server_clock.clone());
        let ctx = context_at(&db_path(&dir), &remote, &clock).await;
        let harness = Self {
            dir,
            ctx,
            remote,
            clock,
        };
        (harness, server_clock)
    }

    /// A harness with one registered, active instance.
    pub async fn with_instance() -> (Self, Instance) {
        let harness = Self::new().await;
        let instance = harness.add_instance("review").await;
        (harness, instance)
    }

    pub async fn add_instance(&self, name: &str) -> Instance {
        commands::create_instance(&self.ctx, instance_input(name)).await.unwrap()
    }

    pub async fn import(&self, remote_change_id: &str) -> Change {
        commands::import_change(&self.ctx, remote_change_id, None).await.unwrap()
    }

    /// Move both our clock and the server's forward.
    pub fn advance(&self, secs: i64) {
        self.clock.advance_secs(secs);
    }

    pub fn db_path(&self) -> PathBuf {
        db_path(&self.dir)
    }
}

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("review.db")
}

/// A context on an existing database, as after a restart.
pub async fn context_at(path: &std::path::Path, remote: &Arc<FakeRemote>, clock: &Arc<ManualClock>) -> AppContext {
    let store = Store::open(path).await.unwrap();
    let clock: Arc<dyn Clock> = clock.clone();
    AppContext::new(store, Arc::new(PassthroughVault), FakeConnector::new(remote.clone())).with_clock(clock)
}

pub fn instance_input(name: &str) -> CreateInstanceInput {
    CreateInstanceInput {
        name: name.to_string(),
        url: format!("https://{}.example.com", name),
        username: "me".to_string(),
        http_password: "app-password".to_string(),
        polling_interval_secs: None,
        max_changes: None,
    }
}

pub fn comment_at(change_id: i64, file_path: &str, line: i64, message: &str) -> CreateCommentInput {
    CreateCommentInput {
        change_id,
        patch_set: None,
        file_path: file_path.to_string(),
        side: None,
        line: Some(line),
        range: None,
        message: message.to_string(),
        unresolved: true,
    }
}

/// Poll `check` with short real sleeps until it holds or ~2s pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
