//! Instance commands: register, list, switch, remove and re-authenticate
//! review servers.
//!
//! Credentials are sealed by the context's vault before they touch the
//! database and are never returned to callers.

use crate::context::AppContext;
use crate::db::instances::{self, NewInstanceRow};
use crate::error::AppError;
use crate::models::{CreateInstanceInput, Credentials, Instance};
use crate::services::credentials::{discard_credentials, seal_credentials};
use crate::services::sync_processor::guarded;
use tokio_util::sync::CancellationToken;

/// Register a review server.
///
/// The first instance registered becomes the active one.
///
/// # Errors
/// - Validation error for an empty name, non-https URL or out-of-range settings
/// - Credential vault error if the credentials cannot be sealed
pub async fn create_instance(ctx: &AppContext, input: CreateInstanceInput) -> Result<Instance, AppError> {
    input.validate()?;

    let sealed = seal_credentials(
        ctx.vault.as_ref(),
        &Credentials {
            username: input.username.trim().to_string(),
            http_password: input.http_password.clone(),
        },
    )?;
    let row = NewInstanceRow {
        name: input.name.trim().to_string(),
        url: Instance::normalize_url(&input.url),
        encrypted_credentials: sealed.clone(),
        polling_interval_secs: input
            .polling_interval_secs
            .unwrap_or(Instance::DEFAULT_POLLING_INTERVAL_SECS),
        max_changes: input.max_changes.unwrap_or(Instance::DEFAULT_MAX_CHANGES),
    };

    let now = ctx.now();
    let result = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                let created = instances::insert(conn, &row, now).await?;
                if instances::active(conn).await?.is_none() {
                    instances::set_active(conn, created.id, now).await?;
                }
                instances::require(conn, created.id).await
            })
        })
        .await;

    let instance = match result {
        Ok(instance) => instance,
        Err(e) => {
            discard_credentials(ctx.vault.as_ref(), &sealed);
            return Err(e);
        }
    };

    if instance.is_active {
        ctx.session.set_active_instance(Some(instance.id));
    }
    log::info!("Registered instance {} ({})", instance.id, instance.url);
    Ok(instance)
}

pub async fn list_instances(ctx: &AppContext) -> Result<Vec<Instance>, AppError> {
    let mut conn = ctx.store.acquire().await?;
    instances::list(&mut conn).await
}

/// Make `instance_id` the active instance.
///
/// The session switches first so no new run starts for the old instance.
/// A run already in flight for it is then cancelled and awaited.
pub async fn set_active_instance(ctx: &AppContext, instance_id: i64) -> Result<Instance, AppError> {
    {
        let mut conn = ctx.store.acquire().await?;
        instances::require(&mut conn, instance_id).await?;
    }

    let previous = ctx.session.replace_active_instance(Some(instance_id));
    if let Some(current) = previous.filter(|current| *current != instance_id) {
        while ctx.session.cancel_run(current) {
            log::info!("Cancelling sync of instance {} before switching", current);
            ctx.session.wait_idle(current).await;
        }
    }

    let now = ctx.now();
    let switched = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                instances::set_active(conn, instance_id, now).await?;
                instances::require(conn, instance_id).await
            })
        })
        .await;

    match switched {
        Ok(instance) => Ok(instance),
        Err(e) => {
            ctx.session.set_active_instance(previous);
            Err(e)
        }
    }
}

/// Remove an instance with everything imported from it.
///
/// When the active instance is removed, the oldest remaining one takes over.
pub async fn delete_instance(ctx: &AppContext, instance_id: i64) -> Result<(), AppError> {
    let instance = {
        let mut conn = ctx.store.acquire().await?;
        instances::require(&mut conn, instance_id).await?
    };

    if ctx.session.cancel_run(instance_id) {
        ctx.session.wait_idle(instance_id).await;
    }

    let now = ctx.now();
    let successor = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                instances::delete(conn, instance_id).await?;
                if instances::active(conn).await?.is_some() {
                    return Ok(None);
                }
                match instances::oldest(conn).await? {
                    Some(next) => {
                        instances::set_active(conn, next, now).await?;
                        Ok(Some(next))
                    }
                    None => Ok(None),
                }
            })
        })
        .await?;

    discard_credentials(ctx.vault.as_ref(), &instance.encrypted_credentials);
    ctx.session.forget_instance(instance_id);
    if instance.is_active || ctx.session.active_instance() == Some(instance_id) {
        ctx.session.set_active_instance(successor);
    }
    log::info!("Deleted instance {} ({})", instance_id, instance.url);
    Ok(())
}

/// Replace an instance's credentials and clear `requires_reauth`.
///
/// The new credentials are tried against the server first; a rejection
/// keeps the old ones. When the server cannot be reached they are stored
/// anyway and verified by the next sync.
pub async fn reauthenticate(
    ctx: &AppContext,
    instance_id: i64,
    credentials: Credentials,
) -> Result<Instance, AppError> {
    if credentials.username.trim().is_empty() {
        return Err(AppError::validation_field("Username must not be empty", "username"));
    }
    if credentials.http_password.is_empty() {
        return Err(AppError::validation_field("HTTP password must not be empty", "http_password"));
    }

    let instance = {
        let mut conn = ctx.store.acquire().await?;
        instances::require(&mut conn, instance_id).await?
    };

    let timeout = ctx.settings().request_timeout();
    let client = ctx.connector.connect(&instance, credentials.clone(), timeout)?;
    match guarded(&CancellationToken::new(), timeout, client.server_version()).await {
        Ok(version) => log::debug!("Re-authenticated against {} ({})", instance.url, version),
        Err(e) if e.is_authentication_failure() => {
            return Err(AppError::authentication_for_instance(
                "The server rejected the new credentials",
                instance_id,
            ))
        }
        Err(e) => log::warn!("Could not verify credentials for {}: {}", instance.url, e),
    }

    let sealed = seal_credentials(ctx.vault.as_ref(), &credentials)?;
    let now = ctx.now();
    let stored = sealed.clone();
    let updated = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                instances::update_credentials(conn, instance_id, &stored, now).await?;
                instances::require(conn, instance_id).await
            })
        })
        .await;

    let updated = match updated {
        Ok(updated) => updated,
        Err(e) => {
            discard_credentials(ctx.vault.as_ref(), &sealed);
            return Err(e);
        }
    };

    discard_credentials(ctx.vault.as_ref(), &instance.encrypted_credentials);
    ctx.session.acknowledge_error(instance_id);
    ctx.session.mark_version_checked(instance_id, false);
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures;
    use crate::services::credentials::open_credentials;
    use crate::session::EngineState;
    use crate::testing::{FakeConnector, FakeFailure, FakeRemote, PassthroughVault};
    use std::sync::Arc;

    fn input(name: &str) -> CreateInstanceInput {
        CreateInstanceInput {
            name: name.into(),
            url: format!("https://{}.example/", name),
            username: "me".into(),
            http_password: "secret".into(),
            polling_interval_secs: None,
            max_changes: None,
        }
    }

    async fn setup() -> (tempfile::TempDir, AppContext, Arc<FakeRemote>) {
        let (dir, store) = fixtures::open_store().await;
        let remote = FakeRemote::new();
        let ctx = AppContext::new(store, Arc::new(PassthroughVault), FakeConnector::new(remote.clone()));
        (dir, ctx, remote)
    }

    #[tokio::test]
    async fn test_first_instance_becomes_active() {
        let (_dir, ctx, _remote) = setup().await;

        let first = create_instance(&ctx, input("alpha")).await.unwrap();
        let second = create_instance(&ctx, input("beta")).await.unwrap();

        assert!(first.is_active);
        assert!(!second.is_active);
        assert_eq!(first.url, "https://alpha.example");
        assert_eq!(first.polling_interval_secs, Instance::DEFAULT_POLLING_INTERVAL_SECS);
        assert_eq!(ctx.session.active_instance(), Some(first.id));

        let credentials = open_credentials(ctx.vault.as_ref(), &first.encrypted_credentials).unwrap();
        assert_eq!(credentials.username, "me");
    }

    #[tokio::test]
    async fn test_invalid_input_stores_nothing() {
        let (_dir, ctx, _remote) = setup().await;
        let mut bad = input("alpha");
        bad.url = "http://alpha.example".into();

        let err = create_instance(&ctx, bad).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError { .. }));
        assert!(list_instances(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_switching_keeps_a_single_active_instance() {
        let (_dir, ctx, _remote) = setup().await;
        let first = create_instance(&ctx, input("alpha")).await.unwrap();
        let second = create_instance(&ctx, input("beta")).await.unwrap();

        set_active_instance(&ctx, second.id).await.unwrap();

        let all = list_instances(&ctx).await.unwrap();
        assert_eq!(all.iter().filter(|i| i.is_active).count(), 1);
        assert!(all.iter().any(|i| i.id == second.id && i.is_active));
        assert_eq!(ctx.session.active_instance(), Some(second.id));

        delete_instance(&ctx, second.id).await.unwrap();
        assert_eq!(ctx.session.active_instance(), Some(first.id));
        let remaining = list_instances(&ctx).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].is_active);
    }

    #[tokio::test]
    async fn test_switching_waits_for_the_old_run() {
        let (_dir, ctx, _remote) = setup().await;
        let first = create_instance(&ctx, input("alpha")).await.unwrap();
        let second = create_instance(&ctx, input("beta")).await.unwrap();

        let guard = ctx.session.begin_run(first.id).unwrap();
        let run = tokio::spawn(async move {
            guard.token().cancelled().await;
            drop(guard);
        });

        set_active_instance(&ctx, second.id).await.unwrap();
        assert!(!ctx.session.is_running(first.id));
        run.await.unwrap();
        assert_eq!(ctx.session.active_instance(), Some(second.id));

        // Switching back to the same instance cancels nothing.
        let guard = ctx.session.begin_run(second.id).unwrap();
        set_active_instance(&ctx, second.id).await.unwrap();
        assert!(!guard.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_the_session() {
        let (_dir, ctx, _remote) = setup().await;
        let first = create_instance(&ctx, input("alpha")).await.unwrap();

        let err = set_active_instance(&ctx, first.id + 100).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
        assert_eq!(ctx.session.active_instance(), Some(first.id));
    }

    #[tokio::test]
    async fn test_reauthenticate_clears_the_halt() {
        let (_dir, ctx, remote) = setup().await;
        let instance = create_instance(&ctx, input("alpha")).await.unwrap();
        {
            let mut conn = ctx.store.acquire().await.unwrap();
            instances::set_requires_reauth(&mut conn, instance.id, true, 0).await.unwrap();
        }
        ctx.session.set_state(
            instance.id,
            EngineState::Error {
                message: "rejected".into(),
            },
        );

        remote.fail_next("server_version", FakeFailure::Unauthorized);
        let fresh = Credentials {
            username: "me".into(),
            http_password: "rotated".into(),
        };
        let err = reauthenticate(&ctx, instance.id, fresh.clone()).await.unwrap_err();
        assert!(err.is_authentication_failure());

        let updated = reauthenticate(&ctx, instance.id, fresh).await.unwrap();
        assert!(!updated.requires_reauth);
        assert_eq!(ctx.session.state(instance.id), EngineState::Idle);
        let credentials = open_credentials(ctx.vault.as_ref(), &updated.encrypted_credentials).unwrap();
        assert_eq!(credentials.http_password, "rotated");
    }
}
