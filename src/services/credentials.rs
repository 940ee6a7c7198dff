//! Credential vault.
//!
//! Instance credentials are only persisted as ciphertext produced by a
//! [`CredentialVault`]. The database column holds that ciphertext base64
//! encoded. [`KeychainVault`] keeps the secret in the system's native
//! credential storage (Keychain on macOS, Credential Manager on Windows,
//! Secret Service on Linux) and hands out an opaque handle as ciphertext.

use crate::error::AppError;
use crate::models::Credentials;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyring::Entry;
use std::fmt;

/// Service name used in the keychain.
const SERVICE_NAME: &str = "gerrit-offline";

/// Prefix of keychain handles.
const HANDLE_PREFIX: &str = "keychain:";

/// Opaque encrypt/decrypt service.
pub trait CredentialVault: Send + Sync + fmt::Debug {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AppError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, AppError>;

    /// Release anything held for `ciphertext`. Idempotent.
    fn forget(&self, _ciphertext: &[u8]) -> Result<(), AppError> {
        Ok(())
    }
}

/// Vault backed by the OS keychain.
#[derive(Debug, Clone)]
pub struct KeychainVault {
    service: String,
}

impl Default for KeychainVault {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl KeychainVault {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, account: &str) -> Result<Entry, AppError> {
        Entry::new(&self.service, account)
            .map_err(|e| AppError::vault(format!("Failed to create keyring entry: {}", e)))
    }

    fn account_of(ciphertext: &[u8]) -> Result<&str, AppError> {
        std::str::from_utf8(ciphertext)
            .ok()
            .and_then(|s| s.strip_prefix(HANDLE_PREFIX))
            .ok_or_else(|| AppError::vault("Unrecognized credential handle"))
    }
}

impl CredentialVault for KeychainVault {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AppError> {
        let account = uuid::Uuid::new_v4().to_string();
        self.entry(&account)?
            .set_secret(plaintext)
            .map_err(|e| AppError::vault(format!("Failed to store credentials: {}", e)))?;
        Ok(format!("{}{}", HANDLE_PREFIX, account).into_bytes())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, AppError> {
        let account = Self::account_of(ciphertext)?;
        self.entry(account)?.get_secret().map_err(|e| match e {
            keyring::Error::NoEntry => AppError::not_found_with_id("credential", account),
            _ => AppError::vault(format!("Failed to retrieve credentials: {}", e)),
        })
    }

    fn forget(&self, ciphertext: &[u8]) -> Result<(), AppError> {
        let account = Self::account_of(ciphertext)?;
        match self.entry(account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AppError::vault(format!("Failed to delete credentials: {}", e))),
        }
    }
}

/// Encrypt credentials into the form stored in `instances.encrypted_credentials`.
pub fn seal_credentials(vault: &dyn CredentialVault, credentials: &Credentials) -> Result<String, AppError> {
    let plaintext = serde_json::to_vec(credentials)?;
    let ciphertext = vault.encrypt(&plaintext)?;
    Ok(STANDARD.encode(ciphertext))
}

/// Reverse of [`seal_credentials`].
pub fn open_credentials(vault: &dyn CredentialVault, sealed: &str) -> Result<Credentials, AppError> {
    let ciphertext = STANDARD
        .decode(sealed)
        .map_err(|e| AppError::vault(format!("Corrupt credential ciphertext: {}", e)))?;
    let plaintext = vault.decrypt(&ciphertext)?;
    serde_json::from_slice(&plaintext).map_err(|e| AppError::vault(format!("Corrupt credentials: {}", e)))
}

/// Release the vault entry behind a stored ciphertext, logging failures.
pub fn discard_credentials(vault: &dyn CredentialVault, sealed: &str) {
    let result = STANDARD
        .decode(sealed)
        .map_err(|e| AppError::vault(e.to_string()))
        .and_then(|ciphertext| vault.forget(&ciphertext));
    if let Err(e) = result {
        log::warn!("Failed to discard stored credentials: {}", e);
    }
}
