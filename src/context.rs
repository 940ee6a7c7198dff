//! Application context handed to every command.
//!
//! Bundles the store with the injected collaborators (vault, remote
//! connector, clock) and the per-process session. Cheap to clone.

use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::db::{instances, sync_runs, Store};
use crate::error::AppError;
use crate::models::Instance;
use crate::services::credentials::{open_credentials, CredentialVault, KeychainVault};
use crate::services::gerrit_client::GerritConnector;
use crate::services::operation_queue;
use crate::services::remote::{RemoteClient, RemoteConnector};
use crate::services::sync_events::EventBus;
use crate::session::SessionContext;
use std::path::Path;
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct AppContext {
    pub store: Store,
    pub vault: Arc<dyn CredentialVault>,
    pub connector: Arc<dyn RemoteConnector>,
    pub session: Arc<SessionContext>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
    settings: Arc<RwLock<Settings>>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("store", &self.store)
            .field("session", &self.session)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub fn new(store: Store, vault: Arc<dyn CredentialVault>, connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            store,
            vault,
            connector,
            session: Arc::new(SessionContext::new()),
            clock: Arc::new(SystemClock),
            events: EventBus::new(),
            settings: Arc::new(RwLock::new(Settings::default())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(self, settings: Settings) -> Self {
        self.set_settings(settings);
        self
    }

    /// Open the production context: the database at `db_path`, the OS
    /// keychain and the Gerrit REST connector. Runs startup recovery.
    pub async fn open(db_path: &Path, settings: Settings) -> Result<Self, AppError> {
        let store = Store::open(db_path).await?;
        let ctx = Self::new(store, Arc::new(KeychainVault::default()), Arc::new(GerritConnector))
            .with_settings(settings);
        ctx.recover().await?;
        Ok(ctx)
    }

    /// Current Unix time from the injected clock.
    pub fn now(&self) -> i64 {
        self.clock.unix()
    }

    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_settings(&self, settings: Settings) {
        *self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
    }

    /// Startup recovery after a crash or unclean shutdown.
    ///
    /// Requeues entries left `Processing`, closes sync runs left `Running`
    /// and restores the active instance into the session.
    pub async fn recover(&self) -> Result<(), AppError> {
        let now = self.now();
        let mut conn = self.store.acquire().await?;

        let requeued = operation_queue::recover_interrupted(&mut conn, now).await?;
        let abandoned = sync_runs::fail_abandoned(&mut conn, now).await?;
        if requeued > 0 || abandoned > 0 {
            log::info!(
                "Recovered {} interrupted operation(s) and {} abandoned sync run(s)",
                requeued,
                abandoned
            );
        }

        let active = instances::active(&mut conn).await?;
        self.session.set_active_instance(active.map(|i| i.id));
        Ok(())
    }

    /// The active instance id, or a validation error when none is configured.
    pub fn require_active_instance(&self) -> Result<i64, AppError> {
        self.session
            .active_instance()
            .ok_or_else(|| AppError::validation("No active instance configured"))
    }

    /// Build a client for an instance.
    ///
    /// Refuses instances flagged `requires_reauth` so no request is made
    /// with credentials the server already rejected.
    pub async fn connect(&self, instance_id: i64) -> Result<(Instance, Arc<dyn RemoteClient>), AppError> {
        let instance = {
            let mut conn = self.store.acquire().await?;
            instances::require(&mut conn, instance_id).await?
        };

        if instance.requires_reauth {
            return Err(AppError::authentication_for_instance(
                "Re-authentication required before contacting the server",
                instance_id,
            ));
        }

        let credentials = open_credentials(self.vault.as_ref(), &instance.encrypted_credentials)?;
        let client = self
            .connector
            .connect(&instance, credentials, self.settings().request_timeout())?;
        Ok((instance, client))
    }
}
