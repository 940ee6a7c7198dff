//! Business logic services.
//!
//! This module contains the core logic for talking to the review server,
//! importing changes, queueing local mutations and reconciling the two
//! sides during sync.
//!
//! Services take an [`AppContext`](crate::context::AppContext) or a
//! connection and never reach for process-wide state.

pub mod conflict_resolver;
pub mod credentials;
pub mod gerrit_client;
pub mod importer;
pub mod operation_queue;
pub mod remote;
pub mod sync_engine;
pub mod sync_events;
pub mod sync_processor;

pub use credentials::{CredentialVault, KeychainVault};
pub use gerrit_client::{GerritClient, GerritConnector};
pub use remote::{RemoteClient, RemoteConnector};
pub use sync_engine::{SyncEngine, SyncHandle};
