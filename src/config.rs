//! Engine settings.
//!
//! Persisted as a JSON file. Missing keys take their defaults so settings
//! written by older versions keep loading.

use crate::error::AppError;
use crate::services::operation_queue::QueuePolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default remote request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Background sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Whether the background loop polls at all.
    pub background_enabled: bool,

    /// Interval used until the active instance's own setting is known.
    pub interval_secs: u64,

    /// Delay before the first background run.
    pub startup_delay_secs: u64,

    /// Completed queue entries older than this are purged after a run.
    pub purge_completed_after_secs: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            background_enabled: true,
            interval_secs: 300,
            startup_delay_secs: 3,
            purge_completed_after_secs: 7 * 24 * 3600,
        }
    }
}

/// Options for `import_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    /// Fetch and cache file diffs of the current patch set.
    pub include_diffs: bool,

    pub include_comments: bool,

    /// Files per write transaction.
    pub batch_size: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            include_diffs: true,
            include_comments: true,
            batch_size: 500,
        }
    }
}

/// Application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sync: SyncConfig,
    pub import: ImportOptions,
    pub queue: QueuePolicy,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            import: ImportOptions::default(),
            queue: QueuePolicy::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Load settings from `path`, using defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(AppError::internal(format!("Failed to read settings: {}", e))),
        };

        match serde_json::from_str(&raw) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                log::warn!("Ignoring unreadable settings at {}: {}", path.display(), e);
                Ok(Self::default())
            }
        }
    }

    /// Save settings to `path`.
    pub fn save(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::internal(format!("Failed to create settings directory: {}", e)))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| AppError::internal(format!("Failed to save settings: {}", e)))
    }
}
