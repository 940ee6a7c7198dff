//! Application error types.
//!
//! Every exposed operation returns `Result<_, AppError>`. Errors serialize to a
//! structured JSON object so UI and CLI callers can branch on `type` and show
//! the human-readable message.

use crate::db::StorageError;
use serde::Serialize;
use thiserror::Error;

/// Application-level errors returned from commands and services.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AppError {
    /// Local store operation failed.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },

    /// The remote rejected our credentials; re-authentication is required.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        instance_id: Option<i64>,
    },

    /// A remote call did not complete within the configured timeout.
    #[error("Network timeout: {message}")]
    NetworkTimeout { message: String },

    /// Connection-level failure (DNS, refused, reset).
    #[error("Network error: {message}")]
    Network { message: String },

    /// The remote server is older than the minimum supported version.
    #[error("Server version {found} is not supported (minimum {minimum})")]
    VersionIncompatible { found: String, minimum: String },

    /// The remote server does not know the requested change.
    #[error("Change not found: {change_id}")]
    ChangeNotFound { change_id: String },

    /// Requested local resource not found.
    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Malformed input, rejected before anything is stored or queued.
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    /// Local and remote state diverged; the change is paused until resolved.
    #[error("Conflict detected on change {change_id}: {count} open conflict(s)")]
    ConflictDetected { change_id: i64, count: i64 },

    /// A queued operation exhausted its retries.
    #[error("Sync failed: {message}")]
    SyncFailed {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation_id: Option<i64>,
    },

    /// A sync run is already in flight for this instance.
    #[error("A sync run is already in progress for instance {instance_id}")]
    SyncInProgress { instance_id: i64 },

    /// The operation was cancelled by the user.
    #[error("Operation cancelled")]
    Cancelled,

    /// The remote API answered with an error status.
    #[error("Remote API error: {message}")]
    RemoteApi {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// Credential vault failed to encrypt or decrypt.
    #[error("Credential vault error: {message}")]
    CredentialVault { message: String },

    /// Internal application error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            operation: None,
        }
    }

    pub fn storage_with_op(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
            instance_id: None,
        }
    }

    /// Create an authentication error attributed to an instance.
    pub fn authentication_for_instance(message: impl Into<String>, instance_id: i64) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
            instance_id: Some(instance_id),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::NetworkTimeout {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn change_not_found(change_id: impl Into<String>) -> Self {
        Self::ChangeNotFound {
            change_id: change_id.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: None,
        }
    }

    pub fn not_found_with_id(resource: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: Some(id.to_string()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field.
    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn sync_failed(message: impl Into<String>, operation_id: i64) -> Self {
        Self::SyncFailed {
            message: message.into(),
            operation_id: Some(operation_id),
        }
    }

    pub fn remote_api(message: impl Into<String>) -> Self {
        Self::RemoteApi {
            message: message.into(),
            status_code: None,
            endpoint: None,
        }
    }

    /// Create a remote API error with status code and endpoint.
    pub fn remote_api_full(message: impl Into<String>, status_code: u16, endpoint: impl Into<String>) -> Self {
        Self::RemoteApi {
            message: message.into(),
            status_code: Some(status_code),
            endpoint: Some(endpoint.into()),
        }
    }

    pub fn vault(message: impl Into<String>) -> Self {
        Self::CredentialVault {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage { .. } => "storage_error",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::NetworkTimeout { .. } => "network_timeout",
            Self::Network { .. } => "network_error",
            Self::VersionIncompatible { .. } => "version_incompatible",
            Self::ChangeNotFound { .. } => "change_not_found",
            Self::NotFound { .. } => "not_found",
            Self::ValidationError { .. } => "validation_error",
            Self::ConflictDetected { .. } => "conflict_detected",
            Self::SyncFailed { .. } => "sync_failed",
            Self::SyncInProgress { .. } => "sync_in_progress",
            Self::Cancelled => "cancelled",
            Self::RemoteApi { .. } => "remote_api_error",
            Self::CredentialVault { .. } => "credential_vault_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Whether the operation queue should retry after this error.
    ///
    /// Timeouts, connection failures, throttling and server-side 5xx errors
    /// are transient. Everything else fails the operation terminally.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkTimeout { .. } | Self::Network { .. } => true,
            Self::RemoteApi {
                status_code: Some(code),
                ..
            } => *code == 429 || (500..600).contains(code),
            _ => false,
        }
    }

    /// The server answered 404 for the resource addressed.
    pub fn is_remote_not_found(&self) -> bool {
        matches!(
            self,
            Self::RemoteApi {
                status_code: Some(404),
                ..
            } | Self::ChangeNotFound { .. }
        )
    }

    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }

    /// Errors after which no further remote work makes sense in this run.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed { .. } | Self::VersionIncompatible { .. } | Self::Cancelled
        )
    }
}

// Conversions from common error types

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::from(err).into()
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout("Request timed out")
        } else if err.is_connect() {
            Self::network("Failed to connect to server")
        } else if err.is_status() {
            Self::remote_api(format!("HTTP error: {}", err))
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let err = AppError::storage("connection failed");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"type\":\"Storage\""));
        assert!(json.contains("connection failed"));
    }

    #[test]
    fn test_remote_api_error_full() {
        let err = AppError::remote_api_full("Not Found", 404, "/a/changes/123");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"status_code\":404"));
        assert!(json.contains("/a/changes/123"));
    }

    #[test]
    fn test_optional_fields_not_serialized() {
        let err = AppError::validation("bad url");
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("field"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::timeout("slow").is_transient());
        assert!(AppError::network("refused").is_transient());
        assert!(AppError::remote_api_full("busy", 503, "/a/changes").is_transient());
        assert!(AppError::remote_api_full("slow down", 429, "/a/changes").is_transient());
        assert!(!AppError::remote_api_full("bad request", 400, "/a/changes").is_transient());
        assert!(!AppError::validation("nope").is_transient());
        assert!(!AppError::authentication("expired").is_transient());
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(AppError::Cancelled.code(), "cancelled");
        assert_eq!(AppError::change_not_found("I123").code(), "change_not_found");
        assert_eq!(
            AppError::VersionIncompatible {
                found: "2.16".into(),
                minimum: "3.0".into()
            }
            .code(),
            "version_incompatible"
        );
    }

    #[test]
    fn test_display_impl() {
        let err = AppError::authentication("invalid password");
        assert_eq!(format!("{}", err), "Authentication failed: invalid password");
    }
}
