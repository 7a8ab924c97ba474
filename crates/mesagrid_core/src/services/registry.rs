//! Connection profile registry.
//!
//! Keeps saved profiles in memory, persists them through [`LocalStorage`] and
//! maps a profile id to its pool at runtime. Passwords go to the vault only.

use crate::error::{ConnectionError, CoreError};
use crate::models::{ConnectionProfile, PoolStatus, ProfileDraft, ProfilePatch, Secret};
use crate::services::credentials::CredentialVault;
use crate::services::pool::{PoolManager, ProfilePool};
use crate::services::storage::LocalStorage;

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Saved connection profiles and their runtime pools.
pub struct ConnectionRegistry {
    profiles: RwLock<HashMap<Uuid, ConnectionProfile>>,
    storage: LocalStorage,
    vault: Arc<CredentialVault>,
    pools: Arc<PoolManager>,
}

impl ConnectionRegistry {
    /// Create an empty registry. Call [`load`](Self::load) to restore saved profiles.
    pub fn new(storage: LocalStorage, vault: Arc<CredentialVault>, pools: Arc<PoolManager>) -> Self {
        Self { profiles: RwLock::new(HashMap::new()), storage, vault, pools }
    }

    /// Restore profiles from storage. Returns how many were loaded.
    pub fn load(&self) -> Result<usize, CoreError> {
        let saved = self.storage.load_all_connections()?;
        let count = saved.len();
        let mut profiles = self.profiles.write();
        profiles.clear();
        profiles.extend(saved.into_iter().map(|p| (p.id, p)));
        tracing::info!(count, "Connection profiles loaded");
        Ok(count)
    }

    /// Save a new profile and its password. Returns the stored profile.
    ///
    /// The password is written to the vault before any metadata, and removed
    /// again when the metadata cannot be saved.
    pub fn create(&self, draft: ProfileDraft, password: &Secret) -> Result<ConnectionProfile, CoreError> {
        draft.validate()?;
        let mut profile = ConnectionProfile::from_draft(draft);
        while self.profiles.read().contains_key(&profile.id) {
            profile.id = Uuid::new_v4();
        }

        self.vault.store(profile.id, password)?;
        if let Err(err) = self.storage.save_connection(&profile) {
            if let Err(cleanup) = self.vault.delete(profile.id) {
                tracing::warn!(connection_id = %profile.id, error = %cleanup, "Failed to remove orphaned credential");
            }
            return Err(err);
        }

        self.profiles.write().insert(profile.id, profile.clone());
        tracing::info!(connection_id = %profile.id, name = %profile.name, engine = %profile.engine, "Connection created");
        Ok(profile)
    }

    /// Apply a partial edit and optionally replace the password.
    ///
    /// A changed connectivity field or password closes the profile's pool so
    /// the next use reconnects with the new settings.
    pub fn update(
        &self,
        id: Uuid,
        patch: ProfilePatch,
        password: Option<&Secret>,
    ) -> Result<ConnectionProfile, CoreError> {
        let mut profile = self.get(id)?;
        let reconnect = profile.apply(patch);
        profile.draft().validate()?;

        if let Some(password) = password {
            self.vault.store(id, password)?;
        }
        self.storage.save_connection(&profile)?;
        self.profiles.write().insert(id, profile.clone());

        if (reconnect || password.is_some()) && self.pools.close_pool(id) {
            tracing::info!(connection_id = %id, "Connection settings changed, pool closed");
        }
        tracing::debug!(connection_id = %id, "Connection updated");
        Ok(profile)
    }

    /// Delete a profile, its vault entry and its pool.
    ///
    /// The secret is removed first so a vault failure leaves the profile in
    /// place for a retry.
    pub fn delete(&self, id: Uuid) -> Result<(), CoreError> {
        self.vault.delete(id)?;
        self.storage.delete_connection(id)?;
        let removed = self.profiles.write().remove(&id);
        self.pools.close_pool(id);

        if removed.is_some() {
            tracing::info!(connection_id = %id, "Connection deleted");
        }
        Ok(())
    }

    /// All profiles, most recently connected first, then by name.
    pub fn list(&self) -> Vec<ConnectionProfile> {
        let mut profiles: Vec<_> = self.profiles.read().values().cloned().collect();
        profiles.sort_by(|a, b| {
            b.last_connected_at
                .cmp(&a.last_connected_at)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        profiles
    }

    /// Get a profile by ID.
    pub fn get(&self, id: Uuid) -> Result<ConnectionProfile, ConnectionError> {
        self.profiles.read().get(&id).cloned().ok_or(ConnectionError::ProfileNotFound(id))
    }

    /// The profile's pool, materializing it on first use.
    pub async fn pool_for(&self, id: Uuid) -> Result<Arc<ProfilePool>, ConnectionError> {
        let profile = self.get(id)?;
        let (pool, created) = self.pools.acquire(&profile).await?;
        if created {
            self.stamp_connected(id);
        }
        Ok(pool)
    }

    fn stamp_connected(&self, id: Uuid) {
        let now = Utc::now();
        if let Some(profile) = self.profiles.write().get_mut(&id) {
            profile.last_connected_at = Some(now);
        }
        if let Err(err) = self.storage.update_last_connected(id, now) {
            tracing::warn!(connection_id = %id, error = %err, "Failed to record last connection time");
        }
    }

    /// Open the profile's pool and report its status.
    pub async fn connect(&self, id: Uuid) -> Result<PoolStatus, ConnectionError> {
        Ok(self.pool_for(id).await?.status())
    }

    /// Close the profile's pool.
    pub fn disconnect(&self, id: Uuid) -> Result<(), ConnectionError> {
        self.get(id)?;
        self.pools.close_pool(id);
        Ok(())
    }

    /// Pool manager behind this registry.
    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Credential vault behind this registry.
    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }
}
