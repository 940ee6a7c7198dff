//! Shared rows for repository tests.

use super::{changes, instances, patch_sets, Store};
use crate::models::{Change, ChangeStatus, Instance, PatchSet, PatchSetKind};
use sqlx::SqliteConnection;
use tempfile::TempDir;

pub(crate) async fn open_store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("test.db")).await.unwrap();
    (dir, store)
}

pub(crate) async fn instance(conn: &mut SqliteConnection, url: &str) -> Instance {
    instances::insert(
        conn,
        &instances::NewInstanceRow {
            name: "review".into(),
            url: url.into(),
            encrypted_credentials: "c2VhbGVk".into(),
            polling_interval_secs: 300,
            max_changes: 100,
        },
        0,
    )
    .await
    .unwrap()
}

pub(crate) fn metadata(remote_change_id: &str) -> changes::ChangeMetadata {
    changes::ChangeMetadata {
        remote_change_id: remote_change_id.into(),
        number: 1001,
        project: "platform/core".into(),
        branch: "main".into(),
        subject: "Speed up indexing".into(),
        status: ChangeStatus::New,
        owner: "bob".into(),
        current_revision: "rev1".into(),
        current_patch_set_num: 1,
        remote_updated_at: 100,
        topic: None,
        hashtags: vec![],
    }
}

pub(crate) fn new_patch_set(number: i64) -> patch_sets::NewPatchSet {
    patch_sets::NewPatchSet {
        number,
        revision: format!("rev{}", number),
        author: "bob".into(),
        kind: PatchSetKind::Rework,
        created_at: number,
    }
}

/// An instance with one change whose patch set 1 is current.
pub(crate) async fn change_with_patch_set(conn: &mut SqliteConnection) -> (Change, PatchSet) {
    let instance = instance(conn, "https://review.example").await;
    let change = changes::upsert_importing(conn, instance.id, &metadata("I1"), 10)
        .await
        .unwrap();
    patch_sets::insert(conn, change.id, &new_patch_set(1)).await.unwrap();
    patch_sets::set_current(conn, change.id, 1).await.unwrap();
    let ps = patch_sets::current(conn, change.id).await.unwrap().unwrap();
    (change, ps)
}
