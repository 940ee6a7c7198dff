//! Sync event types and the broadcast bus that carries them.
//!
//! These events are emitted during imports and sync runs so callers can
//! update their state reactively. Sending never blocks and never fails the
//! emitting operation: events nobody listens to are dropped.

use crate::models::{ConflictKind, OperationType};
use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Slow receivers lag and skip events.
const EVENT_CAPACITY: usize = 256;

/// Phase of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Checking the server version.
    Starting,

    /// Fetching remote change and comment state.
    Pulling,

    /// Comparing remote state against the local store.
    Resolving,

    /// Pushing queued local operations.
    Pushing,

    /// Run finished.
    Complete,

    /// Run cancelled by the user.
    Cancelled,

    /// Run aborted on an unrecoverable failure.
    Failed,
}

/// What changed about a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeUpdateType {
    Imported,
    MetadataUpdated,
    CommentsUpdated,
    PatchSetAdded,
    StatusChanged,
}

/// A sync or import event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Progress of a sync run.
    Progress {
        instance_id: i64,
        phase: SyncPhase,
        message: String,
        processed: Option<i64>,
        total: Option<i64>,
        is_error: bool,
    },

    /// Batch progress of an import.
    ImportProgress {
        change_id: i64,
        processed: i64,
        total: i64,
    },

    /// A change's local copy was created or updated.
    ChangeUpdated {
        change_id: i64,
        instance_id: i64,
        update_type: ChangeUpdateType,
    },

    /// A queued operation reached a terminal or retry state.
    OperationSynced {
        operation_id: i64,
        operation_type: OperationType,
        change_id: i64,
        success: bool,
        error: Option<String>,
    },

    /// A divergence was recorded.
    ConflictDetected {
        change_id: i64,
        conflict_id: i64,
        kind: ConflictKind,
    },

    /// The server rejected the stored credentials.
    AuthExpired {
        instance_id: i64,
        instance_url: String,
        message: String,
    },
}

/// Broadcast bus for [`SyncEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        log::trace!("event: {:?}", event);
        // Err only means there are no receivers.
        let _ = self.tx.send(event);
    }

    pub fn progress(&self, instance_id: i64, phase: SyncPhase, message: impl Into<String>) {
        self.emit(SyncEvent::Progress {
            instance_id,
            phase,
            message: message.into(),
            processed: None,
            total: None,
            is_error: matches!(phase, SyncPhase::Failed),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.progress(1, SyncPhase::Pulling, "Pulling 3 change(s)");
        match rx.recv().await.unwrap() {
            SyncEvent::Progress { phase, is_error, .. } => {
                assert_eq!(phase, SyncPhase::Pulling);
                assert!(!is_error);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_receivers_is_silent() {
        EventBus::new().progress(1, SyncPhase::Failed, "nobody listening");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(SyncEvent::AuthExpired {
            instance_id: 2,
            instance_url: "https://review.example".into(),
            message: "expired".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "auth_expired");
        assert_eq!(json["instance_id"], 2);
    }
}
