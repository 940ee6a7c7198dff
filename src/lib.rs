//! Gerrit Offline - local-first Gerrit code review engine.
//!
//! Imports changes into a local SQLite store, lets the user comment, vote
//! and upload patch sets offline, and reconciles with the server through a
//! durable operation queue and a pull → resolve → push sync engine.
//!
//! Embedders build an [`AppContext`] and call into [`commands`]; the
//! background loop is started with [`SyncEngine::start_background`].

pub mod clock;
pub mod commands;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod session;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use context::AppContext;
pub use error::AppError;
pub use services::{SyncEngine, SyncHandle};
