//! Review commands: votes, review messages and patch set uploads.
//!
//! Like comments, these only touch the local store; the sync engine carries
//! them to the server.

use crate::context::AppContext;
use crate::db::reviews::{self, NewReview};
use crate::db::{changes, comments, patch_sets};
use crate::error::AppError;
use crate::models::{
    Change, FileEdit, NewOperation, OperationPayload, OperationQueueEntry, PatchSet, Review, ReviewStatus,
};
use crate::services::operation_queue;
use crate::services::sync_events::{ChangeUpdateType, SyncEvent};
use serde::Deserialize;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, HashSet};

/// Input for [`submit_review`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitReviewInput {
    pub change_id: i64,
    /// Patch set number; the current patch set when omitted.
    pub patch_set: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub labels: BTreeMap<String, i32>,
}

fn validate_labels(labels: &BTreeMap<String, i32>) -> Result<(), AppError> {
    for (label, value) in labels {
        if label.trim().is_empty() || label.chars().any(char::is_whitespace) {
            return Err(AppError::validation_field(format!("Invalid label name '{}'", label), "labels"));
        }
        if !Review::VOTE_RANGE.contains(value) {
            return Err(AppError::validation_field(
                format!(
                    "Vote {} on {} is outside {}..={}",
                    value,
                    label,
                    Review::VOTE_RANGE.start(),
                    Review::VOTE_RANGE.end()
                ),
                "labels",
            ));
        }
    }
    Ok(())
}

fn require_open(change: &Change) -> Result<(), AppError> {
    if !change.is_imported() {
        return Err(AppError::validation(format!("Change {} is not imported yet", change.number)));
    }
    if !change.status.is_open() {
        return Err(AppError::validation(format!(
            "Change {} is {} and no longer accepts reviews",
            change.number, change.status
        )));
    }
    Ok(())
}

async fn resolve_patch_set(
    conn: &mut SqliteConnection,
    change_id: i64,
    number: Option<i64>,
) -> Result<PatchSet, AppError> {
    match number {
        Some(number) => patch_sets::find_by_number(conn, change_id, number)
            .await?
            .ok_or_else(|| AppError::not_found_with_id("PatchSet", number)),
        None => patch_sets::current(conn, change_id)
            .await?
            .ok_or_else(|| AppError::validation("Change has no patch set yet")),
    }
}

fn emit_updated(ctx: &AppContext, change: &Change, update_type: ChangeUpdateType) {
    ctx.events.emit(SyncEvent::ChangeUpdated {
        change_id: change.id,
        instance_id: change.instance_id,
        update_type,
    });
}

/// Queue a review: message, votes and every unpublished comment of the
/// change.
///
/// The comments' own add/update entries run first; the review is marked
/// partially submitted if any of them has not reached the server by then.
///
/// # Errors
/// - Validation error for votes outside -2..=+2, a closed or unimported
///   change, or an empty review
pub async fn submit_review(ctx: &AppContext, input: SubmitReviewInput) -> Result<Review, AppError> {
    validate_labels(&input.labels)?;
    let change = {
        let mut conn = ctx.store.acquire().await?;
        changes::require(&mut conn, input.change_id).await?
    };
    if !input.labels.is_empty() {
        require_open(&change)?;
    } else if !change.is_imported() {
        return Err(AppError::validation(format!("Change {} is not imported yet", change.number)));
    }

    let change_id = change.id;
    let policy = ctx.settings().queue;
    let now = ctx.now();
    let review = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                let patch_set = resolve_patch_set(conn, change_id, input.patch_set).await?;
                let comment_ids: Vec<i64> = comments::unsynced_for_change(conn, change_id)
                    .await?
                    .into_iter()
                    .map(|c| c.id)
                    .collect();
                let message = input.message.trim().to_string();
                if message.is_empty() && input.labels.is_empty() && comment_ids.is_empty() {
                    return Err(AppError::validation("Nothing to submit"));
                }

                let review = reviews::insert(
                    conn,
                    &NewReview {
                        change_id,
                        patch_set_id: patch_set.id,
                        message,
                        labels: input.labels,
                        comment_ids,
                        status: ReviewStatus::PendingSubmission,
                    },
                    now,
                )
                .await?;
                operation_queue::enqueue(
                    conn,
                    &NewOperation::new(change_id, OperationPayload::SubmitReview { review_id: review.id }),
                    &policy,
                    now,
                )
                .await?;
                Ok(review)
            })
        })
        .await?;

    log::info!(
        "Queued review {} on change {} ({} comments, {} labels)",
        review.id,
        change.number,
        review.comment_ids.len(),
        review.labels.len()
    );
    emit_updated(ctx, &change, ChangeUpdateType::MetadataUpdated);
    Ok(review)
}

/// Queue a vote change without a message, on the current patch set.
///
/// A zero vote removes the label.
pub async fn update_labels(
    ctx: &AppContext,
    change_id: i64,
    labels: BTreeMap<String, i32>,
) -> Result<Review, AppError> {
    if labels.is_empty() {
        return Err(AppError::validation_field("No labels given", "labels"));
    }
    validate_labels(&labels)?;
    let change = {
        let mut conn = ctx.store.acquire().await?;
        changes::require(&mut conn, change_id).await?
    };
    require_open(&change)?;

    let policy = ctx.settings().queue;
    let now = ctx.now();
    let review = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                let patch_set = resolve_patch_set(conn, change_id, None).await?;
                let review = reviews::insert(
                    conn,
                    &NewReview {
                        change_id,
                        patch_set_id: patch_set.id,
                        message: String::new(),
                        labels,
                        comment_ids: Vec::new(),
                        status: ReviewStatus::PendingSubmission,
                    },
                    now,
                )
                .await?;
                operation_queue::enqueue(
                    conn,
                    &NewOperation::new(change_id, OperationPayload::UpdateLabels { review_id: review.id }),
                    &policy,
                    now,
                )
                .await?;
                Ok(review)
            })
        })
        .await?;

    emit_updated(ctx, &change, ChangeUpdateType::MetadataUpdated);
    Ok(review)
}

/// Reviews of a change, oldest first.
pub async fn list_reviews(ctx: &AppContext, change_id: i64) -> Result<Vec<Review>, AppError> {
    let mut conn = ctx.store.acquire().await?;
    changes::require(&mut conn, change_id).await?;
    reviews::list_for_change(&mut conn, change_id).await
}

/// Queue a new patch set built from `edits` on top of the current one.
///
/// # Errors
/// - Validation error for no edits, duplicate or empty paths, an empty
///   commit message, or a closed change
pub async fn push_patch_set(
    ctx: &AppContext,
    change_id: i64,
    edits: Vec<FileEdit>,
    message: &str,
) -> Result<OperationQueueEntry, AppError> {
    if edits.is_empty() {
        return Err(AppError::validation_field("A patch set needs at least one edit", "edits"));
    }
    let mut seen = HashSet::new();
    for edit in &edits {
        if edit.path.trim().is_empty() {
            return Err(AppError::validation_field("File path must not be empty", "edits"));
        }
        if !seen.insert(edit.path.as_str()) {
            return Err(AppError::validation_field(format!("{} is edited twice", edit.path), "edits"));
        }
    }
    let message = message.trim().to_string();
    if message.is_empty() {
        return Err(AppError::validation_field("Commit message must not be empty", "message"));
    }

    let change = {
        let mut conn = ctx.store.acquire().await?;
        changes::require(&mut conn, change_id).await?
    };
    require_open(&change)?;

    let policy = ctx.settings().queue;
    let now = ctx.now();
    let entry = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                operation_queue::enqueue(
                    conn,
                    &NewOperation::new(change_id, OperationPayload::PushPatchSet { edits, message }),
                    &policy,
                    now,
                )
                .await
            })
        })
        .await?;

    log::info!("Queued patch set upload for change {}", change.number);
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::changes::import_change;
    use crate::commands::comments::{create_comment, CreateCommentInput};
    use crate::commands::instances::create_instance;
    use crate::db::fixtures;
    use crate::models::{ChangeStatus, CreateInstanceInput, OperationStatus, OperationType};
    use crate::testing::{remote_change, FakeConnector, FakeRemote, PassthroughVault};
    use std::sync::Arc;

    async fn setup() -> (tempfile::TempDir, AppContext, Arc<FakeRemote>, Change) {
        let (dir, store) = fixtures::open_store().await;
        let remote = FakeRemote::new();
        let ctx = AppContext::new(store, Arc::new(PassthroughVault), FakeConnector::new(remote.clone()));
        create_instance(
            &ctx,
            CreateInstanceInput {
                name: "review".into(),
                url: "https://review.example".into(),
                username: "me".into(),
                http_password: "secret".into(),
                polling_interval_secs: None,
                max_changes: None,
            },
        )
        .await
        .unwrap();
        remote.add_change(remote_change("I1", 1, &["a.rs"]));
        let change = import_change(&ctx, "I1", None).await.unwrap();
        (dir, ctx, remote, change)
    }

    fn votes(pairs: &[(&str, i32)]) -> BTreeMap<String, i32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn test_submit_review_bundles_unsynced_comments() {
        let (_dir, ctx, _remote, change) = setup().await;
        let comment = create_comment(
            &ctx,
            CreateCommentInput {
                change_id: change.id,
                patch_set: None,
                file_path: "a.rs".into(),
                side: None,
                line: Some(2),
                range: None,
                message: "rename this".into(),
                unresolved: true,
            },
        )
        .await
        .unwrap();

        let review = submit_review(
            &ctx,
            SubmitReviewInput {
                change_id: change.id,
                patch_set: None,
                message: "Looks good otherwise".into(),
                labels: votes(&[("Code-Review", 1)]),
            },
        )
        .await
        .unwrap();

        assert_eq!(review.status, ReviewStatus::PendingSubmission);
        assert_eq!(review.comment_ids, vec![comment.id]);

        // The review waits behind the comment's add.
        let mut conn = ctx.store.acquire().await.unwrap();
        let entries = operation_queue::entries_for_change(&mut conn, change.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation_type, OperationType::AddComment);
        assert_eq!(entries[1].operation_type, OperationType::SubmitReview);
        assert_eq!(entries[1].status, OperationStatus::WaitingForDependency);
    }

    #[tokio::test]
    async fn test_votes_outside_range_are_rejected() {
        let (_dir, ctx, _remote, change) = setup().await;

        let err = update_labels(&ctx, change.id, votes(&[("Code-Review", 3)])).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError { .. }));

        let err = submit_review(
            &ctx,
            SubmitReviewInput {
                change_id: change.id,
                labels: votes(&[("Verified", -3)]),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::ValidationError { .. }));
        assert!(list_reviews(&ctx, change.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_review_is_rejected() {
        let (_dir, ctx, _remote, change) = setup().await;

        let err = submit_review(
            &ctx,
            SubmitReviewInput {
                change_id: change.id,
                message: "   ".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn test_closed_change_rejects_votes() {
        let (_dir, ctx, _remote, change) = setup().await;
        {
            let mut conn = ctx.store.acquire().await.unwrap();
            changes::set_status(&mut conn, change.id, ChangeStatus::Merged, 5).await.unwrap();
        }

        let err = update_labels(&ctx, change.id, votes(&[("Code-Review", 2)])).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError { .. }));

        let err = push_patch_set(
            &ctx,
            change.id,
            vec![FileEdit {
                path: "a.rs".into(),
                content: Some("fn main() {}\n".into()),
            }],
            "Fix",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn test_push_patch_set_validates_edits() {
        let (_dir, ctx, _remote, change) = setup().await;
        let edit = FileEdit {
            path: "a.rs".into(),
            content: Some("fn main() {}\n".into()),
        };

        let err = push_patch_set(&ctx, change.id, vec![edit.clone(), edit.clone()], "Fix")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError { .. }));

        let entry = push_patch_set(&ctx, change.id, vec![edit], "Fix").await.unwrap();
        assert_eq!(entry.operation_type, OperationType::PushPatchSet);
        assert_eq!(entry.status, OperationStatus::Queued);
    }
}
