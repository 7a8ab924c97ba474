//! Credential vault over pluggable secret stores.
//!
//! ## Provider Selection
//!
//! - **Default**: OS keychain (macOS Keychain, Windows Credential Manager,
//!   Linux Secret Service)
//! - **`MESAGRID_CREDENTIALS=session`**: in-memory store, lost on exit; used by
//!   tests and headless CI
//!
//! Secrets are never written to any file the application owns.

use crate::error::VaultError;
use crate::models::Secret;

use keyring::Entry;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Service name used for keychain entries.
const KEYRING_SERVICE: &str = "mesagrid";

/// Environment variable selecting the credential backend.
pub const CREDENTIALS_ENV: &str = "MESAGRID_CREDENTIALS";

// ============================================================================
// CredentialsProvider Trait
// ============================================================================

/// A secret store addressed by string keys.
pub trait CredentialsProvider: Send + Sync {
    /// Store a secret, replacing any previous value.
    fn store(&self, key: &str, value: &str) -> Result<(), VaultError>;

    /// Get a secret, `None` when absent.
    fn get(&self, key: &str) -> Result<Option<String>, VaultError>;

    /// Delete a secret. Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<(), VaultError>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

// ============================================================================
// KeychainCredentialsProvider
// ============================================================================

/// OS keychain storage.
#[derive(Debug)]
pub struct KeychainCredentialsProvider {
    service: String,
}

impl Default for KeychainCredentialsProvider {
    fn default() -> Self {
        Self { service: KEYRING_SERVICE.to_string() }
    }
}

impl KeychainCredentialsProvider {
    /// Create a keychain provider under the default service name.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Result<Entry, VaultError> {
        Entry::new(&self.service, key).map_err(map_keyring_error)
    }
}

fn map_keyring_error(err: keyring::Error) -> VaultError {
    match err {
        keyring::Error::NoStorageAccess(e) => VaultError::AccessDenied(e.to_string()),
        keyring::Error::PlatformFailure(e) => VaultError::BackendUnavailable(e.to_string()),
        other => VaultError::BackendUnavailable(other.to_string()),
    }
}

impl CredentialsProvider for KeychainCredentialsProvider {
    fn store(&self, key: &str, value: &str) -> Result<(), VaultError> {
        self.entry(key)?.set_password(value).map_err(map_keyring_error)?;
        tracing::debug!(key = key, "Credential stored in keychain");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, VaultError> {
        match self.entry(key)?.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(map_keyring_error(e)),
        }
    }

    fn delete(&self, key: &str) -> Result<(), VaultError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) => {
                tracing::debug!(key = key, "Credential deleted from keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(map_keyring_error(e)),
        }
    }

    fn name(&self) -> &'static str {
        "KeychainCredentialsProvider"
    }
}

// ============================================================================
// SessionCredentialsProvider
// ============================================================================

/// In-memory storage; credentials are lost when the process exits.
#[derive(Debug, Default)]
pub struct SessionCredentialsProvider {
    store: RwLock<HashMap<String, String>>,
}

impl SessionCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialsProvider for SessionCredentialsProvider {
    fn store(&self, key: &str, value: &str) -> Result<(), VaultError> {
        self.store.write().insert(key.to_string(), value.to_string());
        tracing::debug!(key = key, "Credential stored in session");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, VaultError> {
        Ok(self.store.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), VaultError> {
        self.store.write().remove(key);
        tracing::debug!(key = key, "Credential deleted from session");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SessionCredentialsProvider"
    }
}

// ============================================================================
// CredentialVault
// ============================================================================

fn select_provider() -> Arc<dyn CredentialsProvider> {
    let backend = std::env::var(CREDENTIALS_ENV).unwrap_or_default();
    if backend.eq_ignore_ascii_case("session") {
        tracing::debug!(
            provider = "SessionCredentialsProvider",
            reason = "MESAGRID_CREDENTIALS=session",
            "Using session-only credential storage"
        );
        return Arc::new(SessionCredentialsProvider::new());
    }
    Arc::new(KeychainCredentialsProvider::new())
}

/// Password storage keyed by connection id.
///
/// Access is serialized per connection id so concurrent pool growth for one
/// profile does not issue redundant keychain reads.
pub struct CredentialVault {
    provider: Arc<dyn CredentialsProvider>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CredentialVault {
    /// Create a vault over the provider selected by the environment.
    pub fn new() -> Self {
        let provider = select_provider();
        tracing::info!(provider = provider.name(), "Credential vault initialized");
        Self::with_provider(provider)
    }

    /// Create a vault over an explicit provider.
    pub fn with_provider(provider: Arc<dyn CredentialsProvider>) -> Self {
        Self { provider, locks: Mutex::new(HashMap::new()) }
    }

    /// Get the name of the active provider.
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    fn key(connection_id: Uuid) -> String {
        format!("db:{connection_id}")
    }

    fn lock_for(&self, connection_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.lock().entry(connection_id).or_default().clone()
    }

    /// Store the password for a connection.
    pub fn store(&self, connection_id: Uuid, secret: &Secret) -> Result<(), VaultError> {
        let lock = self.lock_for(connection_id);
        let _guard = lock.lock();
        self.provider.store(&Self::key(connection_id), secret.expose())?;
        tracing::debug!(connection_id = %connection_id, "Password stored");
        Ok(())
    }

    /// Retrieve the password for a connection.
    pub fn retrieve(&self, connection_id: Uuid) -> Result<Secret, VaultError> {
        let lock = self.lock_for(connection_id);
        let _guard = lock.lock();
        self.provider
            .get(&Self::key(connection_id))?
            .map(Secret::new)
            .ok_or(VaultError::NotFound(connection_id))
    }

    /// Delete the password for a connection. Absent passwords are ignored.
    pub fn delete(&self, connection_id: Uuid) -> Result<(), VaultError> {
        {
            let lock = self.lock_for(connection_id);
            let _guard = lock.lock();
            self.provider.delete(&Self::key(connection_id))?;
        }
        self.locks.lock().remove(&connection_id);
        tracing::debug!(connection_id = %connection_id, "Password deleted");
        Ok(())
    }

    /// Check if a password exists for a connection.
    pub fn exists(&self, connection_id: Uuid) -> Result<bool, VaultError> {
        match self.retrieve(connection_id) {
            Ok(_) => Ok(true),
            Err(VaultError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Default for CredentialVault {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").field("provider", &self.provider.name()).finish()
    }
}
