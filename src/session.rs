//! Per-process session state: the active instance, sync run guards and the
//! engine state machine.
//!
//! Held in an `Arc` by [`crate::context::AppContext`]; independent contexts
//! never share a session, so tests may run several side by side.

use crate::error::AppError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

/// Sync engine state for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Idle,
    Pulling,
    Resolving,
    Pushing,
    /// Halted on an unrecoverable failure until acknowledged.
    Error { message: String },
}

impl EngineState {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

#[derive(Debug, Default)]
struct RunSlot {
    lock: Arc<tokio::sync::Mutex<()>>,
    token: Option<CancellationToken>,
    state: EngineState,
    version_checked: bool,
}

type Slots = Arc<Mutex<HashMap<i64, RunSlot>>>;

fn lock_slots(slots: &Mutex<HashMap<i64, RunSlot>>) -> MutexGuard<'_, HashMap<i64, RunSlot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct SessionContext {
    active_instance: RwLock<Option<i64>>,
    slots: Slots,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_instance(&self) -> Option<i64> {
        *self
            .active_instance
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_active_instance(&self, instance_id: Option<i64>) {
        self.replace_active_instance(instance_id);
    }

    /// Switch the active instance, returning the one it replaced.
    pub fn replace_active_instance(&self, instance_id: Option<i64>) -> Option<i64> {
        let mut active = self
            .active_instance
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *active, instance_id)
    }

    /// Claim the run guard for `instance_id`.
    ///
    /// Fails with `SyncInProgress` while another run holds it, and refuses to
    /// start while the engine is halted in `Error`.
    pub fn begin_run(&self, instance_id: i64) -> Result<RunGuard, AppError> {
        let mut slots = lock_slots(&self.slots);
        let slot = slots.entry(instance_id).or_default();

        if let EngineState::Error { message } = &slot.state {
            return Err(AppError::SyncFailed {
                message: format!("Sync halted until the error is acknowledged: {}", message),
                operation_id: None,
            });
        }

        let permit = slot
            .lock
            .clone()
            .try_lock_owned()
            .map_err(|_| AppError::SyncInProgress { instance_id })?;

        let token = CancellationToken::new();
        slot.token = Some(token.clone());

        Ok(RunGuard {
            instance_id,
            token,
            slots: self.slots.clone(),
            _permit: permit,
        })
    }

    pub fn is_running(&self, instance_id: i64) -> bool {
        lock_slots(&self.slots)
            .get(&instance_id)
            .map_or(false, |slot| slot.token.is_some())
    }

    /// Cancel the in-flight run, if any. Returns whether one was running.
    pub fn cancel_run(&self, instance_id: i64) -> bool {
        match lock_slots(&self.slots).get(&instance_id).and_then(|s| s.token.as_ref()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until no run holds the guard for `instance_id`.
    pub async fn wait_idle(&self, instance_id: i64) {
        let lock = lock_slots(&self.slots)
            .get(&instance_id)
            .map(|slot| slot.lock.clone());
        if let Some(lock) = lock {
            drop(lock.lock().await);
        }
    }

    pub fn state(&self, instance_id: i64) -> EngineState {
        lock_slots(&self.slots)
            .get(&instance_id)
            .map(|slot| slot.state.clone())
            .unwrap_or_default()
    }

    pub fn set_state(&self, instance_id: i64, state: EngineState) {
        lock_slots(&self.slots).entry(instance_id).or_default().state = state;
    }

    /// Leave `Error` for `Idle`. Returns whether the engine was halted.
    pub fn acknowledge_error(&self, instance_id: i64) -> bool {
        let mut slots = lock_slots(&self.slots);
        let slot = slots.entry(instance_id).or_default();
        if slot.state.is_error() {
            slot.state = EngineState::Idle;
            true
        } else {
            false
        }
    }

    pub fn version_checked(&self, instance_id: i64) -> bool {
        lock_slots(&self.slots)
            .get(&instance_id)
            .map_or(false, |slot| slot.version_checked)
    }

    pub fn mark_version_checked(&self, instance_id: i64, checked: bool) {
        lock_slots(&self.slots).entry(instance_id).or_default().version_checked = checked;
    }

    /// Drop everything known about a deleted instance.
    pub fn forget_instance(&self, instance_id: i64) {
        if let Some(slot) = lock_slots(&self.slots).remove(&instance_id) {
            if let Some(token) = slot.token {
                token.cancel();
            }
        }
    }
}

/// Exclusive right to run a sync for one instance. Released on drop.
#[derive(Debug)]
pub struct RunGuard {
    instance_id: i64,
    token: CancellationToken,
    slots: Slots,
    _permit: OwnedMutexGuard<()>,
}

impl RunGuard {
    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(slot) = lock_slots(&self.slots).get_mut(&self.instance_id) {
            slot.token = None;
        }
    }
}
