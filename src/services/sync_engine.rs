//! Sync engine: pull remote state, reconcile, push the operation queue.
//!
//! One run per instance at a time, guarded by the session. A run moves the
//! engine through `Pulling → Resolving → Pushing` and back to `Idle`;
//! rejected credentials or an incompatible server halt it in `Error` until
//! acknowledged. The background loop is driven by the context's [`Clock`]
//! so it can be stepped deterministically.
//!
//! [`Clock`]: crate::clock::Clock

use crate::context::AppContext;
use crate::db::sync_runs::{self, RunTotals};
use crate::db::{changes, instances};
use crate::error::AppError;
use crate::models::{Change, Instance, OperationType, ResolutionStrategy, SyncRun, SyncRunState, SyncType};
use crate::services::conflict_resolver;
use crate::services::operation_queue::{self, BatchScope};
use crate::services::remote::{parse_version, RemoteClient};
use crate::services::sync_events::{SyncEvent, SyncPhase};
use crate::services::sync_processor::{self, guarded};
use crate::session::{EngineState, RunGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Oldest server release the client speaks to.
pub const MIN_SERVER_VERSION: &str = "3.0";
const MIN_SERVER_VERSION_PARTS: (u32, u32) = (3, 0);

/// Run one sync for the active instance.
///
/// `change_ids` narrows the run to those local changes; `None` covers every
/// imported change of the instance. Returns the recorded run when it
/// completed or was cancelled; aborting failures are recorded on the run and
/// then returned.
pub async fn sync_changes(
    ctx: &AppContext,
    change_ids: Option<Vec<i64>>,
    sync_type: SyncType,
    strategy: ResolutionStrategy,
) -> Result<SyncRun, AppError> {
    let instance_id = ctx.require_active_instance()?;
    let guard = ctx.session.begin_run(instance_id)?;
    if ctx.session.active_instance() != Some(instance_id) {
        log::info!("Instance {} was switched away before its sync started", instance_id);
        return Err(AppError::Cancelled);
    }

    let run = {
        let mut conn = ctx.store.acquire().await?;
        sync_runs::start(&mut conn, instance_id, sync_type, ctx.now()).await?
    };
    log::info!("Sync run #{} ({}) started for instance {}", run.id, sync_type, instance_id);
    ctx.events.progress(instance_id, SyncPhase::Starting, format!("Starting {} sync", sync_type));

    let mut totals = RunTotals::default();
    let outcome = run_phases(ctx, &guard, change_ids, sync_type, strategy, &mut totals).await;

    let state = match &outcome {
        Ok(()) => SyncRunState::Completed,
        Err(AppError::Cancelled) => SyncRunState::Cancelled,
        Err(e) => {
            totals.errors.push(e.to_string());
            SyncRunState::Failed
        }
    };

    match &outcome {
        Ok(()) => {
            ctx.session.set_state(instance_id, EngineState::Idle);
            ctx.events.emit(SyncEvent::Progress {
                instance_id,
                phase: SyncPhase::Complete,
                message: format!(
                    "Sync complete: {} item(s), {} conflict(s), {} error(s)",
                    totals.items_processed,
                    totals.conflicts_detected,
                    totals.errors.len()
                ),
                processed: Some(totals.items_processed),
                total: Some(totals.items_total),
                is_error: false,
            });
        }
        Err(AppError::Cancelled) => {
            ctx.session.set_state(instance_id, EngineState::Idle);
            ctx.events.progress(instance_id, SyncPhase::Cancelled, "Sync cancelled");
            log::info!("Sync run #{} cancelled", run.id);
        }
        Err(e) => {
            halt(ctx, instance_id, e).await?;
            ctx.events.progress(instance_id, SyncPhase::Failed, e.to_string());
            log::error!("Sync run #{} failed: {}", run.id, e);
        }
    }

    let finished = {
        let mut conn = ctx.store.acquire().await?;
        let finished = sync_runs::finish(&mut conn, run.id, state, &totals, ctx.now()).await?;
        let cutoff = ctx.now() - ctx.settings().sync.purge_completed_after_secs;
        let purged = operation_queue::purge_completed(&mut conn, cutoff).await?;
        if purged > 0 {
            log::debug!("Purged {} completed operation(s)", purged);
        }
        finished
    };
    drop(guard);

    match outcome {
        Ok(()) | Err(AppError::Cancelled) => Ok(finished),
        Err(e) => Err(e),
    }
}

/// Move the engine to its post-failure state.
///
/// Rejected credentials flag the instance and halt the engine; an
/// incompatible server halts it. Anything else leaves it `Idle`.
async fn halt(ctx: &AppContext, instance_id: i64, error: &AppError) -> Result<(), AppError> {
    if error.is_authentication_failure() {
        let instance = {
            let mut conn = ctx.store.acquire().await?;
            instances::set_requires_reauth(&mut conn, instance_id, true, ctx.now()).await?;
            instances::require(&mut conn, instance_id).await?
        };
        ctx.session.set_state(
            instance_id,
            EngineState::Error {
                message: error.to_string(),
            },
        );
        ctx.events.emit(SyncEvent::AuthExpired {
            instance_id,
            instance_url: instance.url,
            message: error.to_string(),
        });
        log::warn!("Credentials for instance {} were rejected; sync halted", instance_id);
    } else if matches!(error, AppError::VersionIncompatible { .. }) {
        ctx.session.set_state(
            instance_id,
            EngineState::Error {
                message: error.to_string(),
            },
        );
    } else {
        ctx.session.set_state(instance_id, EngineState::Idle);
    }
    Ok(())
}

async fn run_phases(
    ctx: &AppContext,
    guard: &RunGuard,
    change_ids: Option<Vec<i64>>,
    sync_type: SyncType,
    strategy: ResolutionStrategy,
    totals: &mut RunTotals,
) -> Result<(), AppError> {
    let instance_id = guard.instance_id();
    let token = guard.token();
    let (instance, client) = ctx.connect(instance_id).await?;

    check_server_version(ctx, &instance, client.as_ref(), guard).await?;

    let targets = select_changes(ctx, &instance, change_ids, sync_type).await?;
    totals.items_total = targets.len() as i64;
    log::debug!("Sync of instance {} covers {} change(s)", instance_id, targets.len());

    let mut reconciled = Vec::with_capacity(targets.len());
    for (index, change) in targets.iter().enumerate() {
        if token.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        ctx.session.set_state(instance_id, EngineState::Pulling);
        ctx.events.emit(SyncEvent::Progress {
            instance_id,
            phase: SyncPhase::Pulling,
            message: format!("Pulling change {}", change.number),
            processed: Some(index as i64),
            total: Some(targets.len() as i64),
            is_error: false,
        });

        match pull_change(ctx, client.as_ref(), guard, change, sync_type, strategy, totals).await {
            Ok(()) => reconciled.push(change.id),
            Err(e) if e.aborts_run() => return Err(e),
            Err(e) if e.is_remote_not_found() => {
                log::warn!("Change {} no longer exists on the server", change.remote_change_id);
                totals
                    .errors
                    .push(format!("Change {} not found on the server", change.number));
            }
            Err(e) => {
                log::warn!("Pull of change {} failed: {}", change.remote_change_id, e);
                totals.errors.push(format!("Change {}: {}", change.number, e));
                ctx.events.emit(SyncEvent::Progress {
                    instance_id,
                    phase: SyncPhase::Pulling,
                    message: format!("Change {}: {}", change.number, e),
                    processed: None,
                    total: None,
                    is_error: true,
                });
            }
        }
        totals.items_processed += 1;
    }

    if !sync_type.pushes() || reconciled.is_empty() {
        return Ok(());
    }

    if token.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    ctx.session.set_state(instance_id, EngineState::Pushing);
    ctx.events.progress(instance_id, SyncPhase::Pushing, "Pushing local changes");

    let mut scope = BatchScope::changes(reconciled);
    if sync_type == SyncType::CommentsOnly {
        scope = scope.with_types(vec![
            OperationType::AddComment,
            OperationType::UpdateComment,
            OperationType::DeleteComment,
        ]);
    }
    let summary = sync_processor::process_pending(ctx, client.as_ref(), &scope, token).await?;
    log::info!(
        "Pushed {} operation(s), {} retrying, {} failed",
        summary.completed,
        summary.retrying,
        summary.failed
    );

    let attempted = summary.completed + summary.retrying + summary.failed;
    totals.items_total += attempted;
    totals.items_processed += attempted;
    totals.errors.extend(summary.errors);
    Ok(())
}

/// Refuse servers older than [`MIN_SERVER_VERSION`]. Checked once per session.
async fn check_server_version(
    ctx: &AppContext,
    instance: &Instance,
    client: &dyn RemoteClient,
    guard: &RunGuard,
) -> Result<(), AppError> {
    if ctx.session.version_checked(instance.id) {
        return Ok(());
    }

    let timeout = ctx.settings().request_timeout();
    let found = guarded(guard.token(), timeout, client.server_version()).await?;
    match parse_version(&found) {
        Some(version) if version >= MIN_SERVER_VERSION_PARTS => {
            log::info!("{} runs server version {}", instance.url, found);
            ctx.session.mark_version_checked(instance.id, true);
            Ok(())
        }
        _ => Err(AppError::VersionIncompatible {
            found,
            minimum: MIN_SERVER_VERSION.to_string(),
        }),
    }
}

/// Local changes a run of `sync_type` pulls.
async fn select_changes(
    ctx: &AppContext,
    instance: &Instance,
    change_ids: Option<Vec<i64>>,
    sync_type: SyncType,
) -> Result<Vec<Change>, AppError> {
    let mut conn = ctx.store.acquire().await?;
    let mut selected: Vec<Change> = changes::list_for_instance(&mut conn, instance.id)
        .await?
        .into_iter()
        .filter(Change::is_imported)
        .collect();

    if let Some(ids) = &change_ids {
        for id in ids {
            let change = changes::require(&mut conn, *id).await?;
            if change.instance_id != instance.id {
                return Err(AppError::validation_field(
                    format!("Change {} belongs to another instance", id),
                    "change_ids",
                ));
            }
        }
        selected.retain(|c| ids.contains(&c.id));
    }

    if sync_type == SyncType::PushLocal {
        let pending = changes::with_pending_operations(&mut conn, instance.id).await?;
        selected.retain(|c| pending.contains(&c.id));
    }
    Ok(selected)
}

/// Fetch one change and reconcile it in a single transaction.
async fn pull_change(
    ctx: &AppContext,
    client: &dyn RemoteClient,
    guard: &RunGuard,
    change: &Change,
    sync_type: SyncType,
    strategy: ResolutionStrategy,
    totals: &mut RunTotals,
) -> Result<(), AppError> {
    let token = guard.token();
    let timeout = ctx.settings().request_timeout();
    let remote = guarded(token, timeout, client.fetch_change(&change.remote_change_id)).await?;

    // Server timestamps are only compared with server timestamps.
    let unchanged = change.remote_updated_at == Some(remote.updated);
    if sync_type == SyncType::Incremental && unchanged {
        log::debug!("Change {} unchanged since last sync", change.remote_change_id);
        return Ok(());
    }

    let remote_comments = if sync_type.fetches_comments() {
        Some(guarded(token, timeout, client.fetch_comments(&change.remote_change_id)).await?)
    } else {
        None
    };

    ctx.session.set_state(guard.instance_id(), EngineState::Resolving);
    let policy = ctx.settings().queue;
    let now = ctx.now();
    let local = change.clone();
    let outcome = ctx
        .store
        .transaction(move |conn| {
            Box::pin(async move {
                conflict_resolver::reconcile(
                    conn,
                    &local,
                    &remote,
                    remote_comments.as_deref(),
                    strategy,
                    &policy,
                    now,
                )
                .await
            })
        })
        .await?;

    totals.conflicts_detected += outcome.detected.len() as i64;
    for conflict in &outcome.detected {
        if outcome.open.iter().any(|open| open.id == conflict.id) {
            ctx.events.emit(SyncEvent::ConflictDetected {
                change_id: change.id,
                conflict_id: conflict.id,
                kind: conflict.kind,
            });
        }
    }
    for update_type in outcome.updates {
        ctx.events.emit(SyncEvent::ChangeUpdated {
            change_id: change.id,
            instance_id: change.instance_id,
            update_type,
        });
    }
    if outcome.auto_resolved > 0 {
        log::info!(
            "Auto-resolved {} conflict(s) on change {}",
            outcome.auto_resolved,
            change.remote_change_id
        );
    }
    if outcome.conflict_status.blocks_push() {
        log::info!(
            "Change {} is blocked: {}",
            change.remote_change_id,
            outcome.conflict_status
        );
    }
    Ok(())
}

/// Commands accepted by the background loop.
#[derive(Debug)]
pub enum SyncCommand {
    /// Run a sync now.
    TriggerSync,

    /// Connectivity came back: flush the queue now.
    Reconnected,

    /// Change the polling interval (seconds, clamped to the instance range).
    SetInterval(u64),

    Stop,
}

/// Handle to the background loop.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    interval_secs: Arc<AtomicU64>,
}

impl SyncHandle {
    async fn send(&self, command: SyncCommand) -> Result<(), AppError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| AppError::internal("Sync engine not running"))
    }

    pub async fn trigger_sync(&self) -> Result<(), AppError> {
        self.send(SyncCommand::TriggerSync).await
    }

    pub async fn reconnected(&self) -> Result<(), AppError> {
        self.send(SyncCommand::Reconnected).await
    }

    pub async fn set_interval(&self, secs: u64) -> Result<(), AppError> {
        self.send(SyncCommand::SetInterval(secs)).await
    }

    pub async fn stop(&self) -> Result<(), AppError> {
        self.send(SyncCommand::Stop).await
    }

    /// Polling interval currently in effect.
    pub fn interval_secs(&self) -> u64 {
        self.interval_secs.load(Ordering::Relaxed)
    }
}

fn clamp_interval(secs: u64) -> u64 {
    secs.clamp(
        Instance::MIN_POLLING_INTERVAL_SECS as u64,
        Instance::MAX_POLLING_INTERVAL_SECS as u64,
    )
}

/// Background polling.
pub struct SyncEngine;

impl SyncEngine {
    /// Spawn the polling loop on the current runtime.
    ///
    /// The first run happens after `startup_delay_secs`; later runs every
    /// interval, taken from the active instance when one is configured.
    pub fn start_background(ctx: AppContext) -> SyncHandle {
        let (tx, mut rx) = mpsc::channel::<SyncCommand>(16);
        let settings = ctx.settings();
        let interval = Arc::new(AtomicU64::new(clamp_interval(settings.sync.interval_secs)));
        let interval_for_task = interval.clone();

        tokio::spawn(async move {
            if let Some(secs) = instance_interval(&ctx).await {
                interval_for_task.store(secs, Ordering::Relaxed);
            }
            let clock = ctx.clock.clone();
            let startup = chrono::Duration::seconds(settings.sync.startup_delay_secs as i64);
            let mut next = clock.now() + startup;
            log::info!(
                "Background sync started, interval={}s",
                interval_for_task.load(Ordering::Relaxed)
            );

            loop {
                tokio::select! {
                    _ = clock.sleep_until(next) => {
                        if ctx.settings().sync.background_enabled {
                            run_scheduled(&ctx, SyncType::Incremental).await;
                        }
                    }
                    command = rx.recv() => match command {
                        Some(SyncCommand::TriggerSync) => {
                            log::info!("Manual sync triggered");
                            run_scheduled(&ctx, SyncType::Incremental).await;
                        }
                        Some(SyncCommand::Reconnected) => {
                            log::info!("Connectivity restored; flushing queue");
                            run_scheduled(&ctx, SyncType::PushLocal).await;
                        }
                        Some(SyncCommand::SetInterval(secs)) => {
                            let secs = clamp_interval(secs);
                            log::info!("Sync interval set to {}s", secs);
                            interval_for_task.store(secs, Ordering::Relaxed);
                        }
                        Some(SyncCommand::Stop) | None => break,
                    }
                }
                let secs = interval_for_task.load(Ordering::Relaxed) as i64;
                next = clock.now() + chrono::Duration::seconds(secs);
            }
            log::info!("Background sync stopped");
        });

        SyncHandle {
            command_tx: tx,
            interval_secs: interval,
        }
    }
}

async fn instance_interval(ctx: &AppContext) -> Option<u64> {
    let instance_id = ctx.session.active_instance()?;
    let mut conn = ctx.store.acquire().await.ok()?;
    let instance = instances::get(&mut conn, instance_id).await.ok()??;
    Some(clamp_interval(instance.polling_interval_secs as u64))
}

/// One loop-initiated run. Failures are logged, never propagated.
async fn run_scheduled(ctx: &AppContext, sync_type: SyncType) {
    let Some(instance_id) = ctx.session.active_instance() else {
        log::debug!("No active instance; skipping background sync");
        return;
    };
    if ctx.session.state(instance_id).is_error() {
        log::debug!("Sync halted for instance {}; skipping", instance_id);
        return;
    }

    match sync_changes(ctx, None, sync_type, ResolutionStrategy::AutoMerge).await {
        Ok(run) => log::info!(
            "Background sync #{} {:?}: {} item(s), {} conflict(s)",
            run.id,
            run.state,
            run.items_processed,
            run.conflicts_detected
        ),
        Err(AppError::SyncInProgress { .. }) => {
            log::debug!("Sync already running for instance {}", instance_id);
        }
        Err(e) => log::warn!("Background sync failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_is_clamped() {
        assert_eq!(clamp_interval(5), Instance::MIN_POLLING_INTERVAL_SECS as u64);
        assert_eq!(clamp_interval(999_999), Instance::MAX_POLLING_INTERVAL_SECS as u64);
        assert_eq!(clamp_interval(300), 300);
    }

    #[test]
    fn test_minimum_version_parses() {
        assert_eq!(parse_version(MIN_SERVER_VERSION), Some(MIN_SERVER_VERSION_PARTS));
    }
}
