//! Data models for the local store.
//!
//! These models represent the entities stored in the local SQLite database
//! and returned to callers of the command layer.
//!
//! All models derive Serialize for callers and FromRow for SQLx queries.

pub mod change;
pub mod comment;
pub mod conflict;
pub mod file;
pub mod instance;
pub mod operation;
pub mod patch_set;
pub mod review;
pub mod sync_run;

// Re-exports for convenient access
pub use change::{Change, ChangeExtensions, ChangeStatus, ConflictStatus, ImportStatus};
pub use comment::{
    Comment, CommentRange, CommentSide, CommentStatus, CommentThreads, ContentFingerprint, LineSpan,
};
pub use conflict::{
    CommentSnapshot, Conflict, ConflictDetail, ConflictKind, ConflictState, ResolutionStrategy,
};
pub use file::{ChangeFile, FileChangeType, FileReviewStatus};
pub use instance::{CreateInstanceInput, Credentials, Instance};
pub use operation::{
    FileEdit, NewOperation, OperationPayload, OperationQueueEntry, OperationStatus, OperationType,
    Priority,
};
pub use patch_set::{PatchSet, PatchSetKind};
pub use review::{Review, ReviewStatus};
pub use sync_run::{SyncRun, SyncRunState, SyncType};
