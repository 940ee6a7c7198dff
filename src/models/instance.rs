//! Remote server (instance) configuration model.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A configured Gerrit server connection.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Instance {
    /// Local database ID.
    pub id: i64,

    /// Display name.
    pub name: String,

    /// Server URL (always `https://`).
    pub url: String,

    /// Base64 ciphertext produced by the credential vault.
    #[serde(skip_serializing)]
    pub encrypted_credentials: String,

    /// Whether this is the instance sync runs target.
    pub is_active: bool,

    /// Background polling interval in seconds (60..=3600).
    pub polling_interval_secs: i64,

    /// Upper bound on changes tracked for this instance.
    pub max_changes: i64,

    /// Set when the server rejected our credentials.
    pub requires_reauth: bool,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Instance {
    pub const MIN_POLLING_INTERVAL_SECS: i64 = 60;
    pub const MAX_POLLING_INTERVAL_SECS: i64 = 3600;
    pub const DEFAULT_POLLING_INTERVAL_SECS: i64 = 300;
    pub const DEFAULT_MAX_CHANGES: i64 = 100;

    /// Normalize the URL by removing trailing slashes.
    pub fn normalize_url(url: &str) -> String {
        url.trim().trim_end_matches('/').to_string()
    }
}

/// Login material for an instance. Only ever stored encrypted.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    /// Gerrit HTTP password (generated under Settings > HTTP Credentials).
    pub http_password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("http_password", &"<redacted>")
            .finish()
    }
}

/// Input for `create_instance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceInput {
    pub name: String,
    pub url: String,
    pub username: String,
    pub http_password: String,
    #[serde(default)]
    pub polling_interval_secs: Option<i64>,
    #[serde(default)]
    pub max_changes: Option<i64>,
}

impl CreateInstanceInput {
    /// Check every field before anything is encrypted or stored.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::validation_field("Instance name must not be empty", "name"));
        }
        validate_url(&self.url)?;
        if self.username.trim().is_empty() {
            return Err(AppError::validation_field("Username must not be empty", "username"));
        }
        if self.http_password.is_empty() {
            return Err(AppError::validation_field("HTTP password must not be empty", "http_password"));
        }
        if let Some(interval) = self.polling_interval_secs {
            validate_polling_interval(interval)?;
        }
        if let Some(max) = self.max_changes {
            if max <= 0 {
                return Err(AppError::validation_field("max_changes must be positive", "max_changes"));
            }
        }
        Ok(())
    }
}

/// Reject anything that is not an absolute `https://` URL with a host.
pub fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = reqwest::Url::parse(url.trim())
        .map_err(|e| AppError::validation_field(format!("Invalid URL: {}", e), "url"))?;

    if parsed.scheme() != "https" {
        return Err(AppError::validation_field("Instance URL must use https://", "url"));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(AppError::validation_field("Instance URL must include a host", "url"));
    }
    Ok(())
}

pub fn validate_polling_interval(secs: i64) -> Result<(), AppError> {
    if !(Instance::MIN_POLLING_INTERVAL_SECS..=Instance::MAX_POLLING_INTERVAL_SECS).contains(&secs) {
        return Err(AppError::validation_field(
            format!(
                "Polling interval must be between {} and {} seconds",
                Instance::MIN_POLLING_INTERVAL_SECS,
                Instance::MAX_POLLING_INTERVAL_SECS
            ),
            "polling_interval_secs",
        ));
    }
    Ok(())
}
