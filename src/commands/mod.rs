//! Command handlers.
//!
//! This module contains every operation exposed to the embedding
//! application. Commands take an [`AppContext`](crate::context::AppContext),
//! validate synchronously and never wait on the network except where noted.
//! Commands are organized by functionality:
//! - `instances`: review server registration, switching and re-authentication
//! - `changes`: search, import and local browsing of changes
//! - `comments`: offline comment drafting and threads
//! - `reviews`: votes, review messages and patch set uploads
//! - `sync`: sync runs, status, conflicts and failed operations

pub mod changes;
pub mod comments;
pub mod instances;
pub mod reviews;
pub mod sync;

// Re-export commands for convenient access
pub use changes::{get_change, import_change, list_changes, mark_file_reviewed, search_changes};
pub use comments::{create_comment, delete_comment, edit_comment, get_comment_threads, reply_to_comment};
pub use instances::{create_instance, delete_instance, list_instances, reauthenticate, set_active_instance};
pub use reviews::{list_reviews, push_patch_set, submit_review, update_labels};
pub use sync::{
    acknowledge_sync_error, cancel_sync, discard_failed_operation, get_conflicts, get_sync_status,
    resolve_conflict, retry_failed_operation, sync_changes,
};
