//! Process-wide service wiring.
//!
//! [`CoreState`] owns one instance of every service and is shared by the
//! command surface. Construction opens local storage, loads configuration and
//! restores saved profiles; pools are only opened on first use.

use crate::config::{self, CoreConfig};
use crate::engine::{Connector, NativeConnector};
use crate::error::CoreError;
use crate::services::{
    ConnectionRegistry, CredentialVault, CursorPager, LocalStorage, MutationEngine, PoolManager,
    QueryExecutor, SchemaIntrospector,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Central application state.
pub struct CoreState {
    config: CoreConfig,
    data_dir: PathBuf,
    registry: Arc<ConnectionRegistry>,
    schema: Arc<SchemaIntrospector>,
    executor: QueryExecutor,
    pager: CursorPager,
    mutations: MutationEngine,
}

impl CoreState {
    /// Create state in the default data directory with the native drivers and
    /// the credential backend selected by the environment.
    pub fn new() -> Result<Self, CoreError> {
        Self::with_data_dir(&config::default_data_dir())
    }

    /// Create state in a specific data directory.
    pub fn with_data_dir(data_dir: &Path) -> Result<Self, CoreError> {
        Self::with_parts(data_dir, Arc::new(CredentialVault::new()), Arc::new(NativeConnector))
    }

    /// Create state over an explicit vault and connector.
    pub fn with_parts(
        data_dir: &Path,
        vault: Arc<CredentialVault>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, CoreError> {
        config::init_data_dir(data_dir)?;
        let config = CoreConfig::load(data_dir)?;
        let storage = LocalStorage::open(data_dir)?;
        Ok(Self::assemble(config, data_dir.to_path_buf(), storage, vault, connector))
    }

    fn assemble(
        config: CoreConfig,
        data_dir: PathBuf,
        storage: LocalStorage,
        vault: Arc<CredentialVault>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let pools = Arc::new(PoolManager::new(connector, vault.clone(), config.pool.clone()));
        let registry = Arc::new(ConnectionRegistry::new(storage, vault, pools));
        if let Err(err) = registry.load() {
            tracing::error!(error = %err, "Failed to restore saved connections");
        }

        let ttl = config.schema.cache_ttl_secs.map(Duration::from_secs);
        let schema = Arc::new(SchemaIntrospector::new(registry.clone(), ttl));
        let executor = QueryExecutor::new(registry.clone(), schema.clone(), config.query.clone());
        let pager = CursorPager::new(registry.clone(), schema.clone(), config.pager.clone());
        let mutations = MutationEngine::new(registry.clone(), schema.clone());

        tracing::info!(data_dir = %data_dir.display(), "Core state initialized");
        Self { config, data_dir, registry, schema, executor, pager, mutations }
    }

    /// State over in-memory storage, for tests.
    #[cfg(test)]
    pub(crate) fn in_memory(config: CoreConfig, vault: Arc<CredentialVault>, connector: Arc<dyn Connector>) -> Self {
        let storage = LocalStorage::open_in_memory().expect("in-memory storage");
        Self::assemble(config, PathBuf::new(), storage, vault, connector)
    }

    /// Loaded configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Connection profiles and pools.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Catalog reader.
    pub fn schema(&self) -> &Arc<SchemaIntrospector> {
        &self.schema
    }

    /// Ad-hoc query runner.
    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Table pager.
    pub fn pager(&self) -> &CursorPager {
        &self.pager
    }

    /// Row editor.
    pub fn mutations(&self) -> &MutationEngine {
        &self.mutations
    }

    /// Close every pool. Saved profiles are kept.
    pub fn shutdown(&self) {
        self.registry.pools().close_all();
        self.schema.invalidate_all();
        tracing::info!("Core state shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngineType, ProfileDraft, Secret};
    use crate::test_support::{session_vault, FakeConnector};

    #[tokio::test]
    async fn test_profiles_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let vault = session_vault();
        let connector = Arc::new(FakeConnector::new(EngineType::Mysql));

        let id = {
            let state = CoreState::with_parts(dir.path(), vault.clone(), connector.clone()).unwrap();
            let profile = state
                .registry()
                .create(ProfileDraft::new("Shop", EngineType::Mysql, "db", "shop", "root"), &Secret::new("pw"))
                .unwrap();
            state.registry().connect(profile.id).await.unwrap();
            state.shutdown();
            profile.id
        };

        let state = CoreState::with_parts(dir.path(), vault, connector).unwrap();
        let restored = state.registry().get(id).unwrap();
        assert_eq!(restored.name, "Shop");
        assert!(restored.last_connected_at.is_some());
        assert!(!state.registry().pools().is_connected(id));
    }

    #[test]
    fn test_config_file_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"query": {"default_row_limit": 25}}"#).unwrap();
        let state = CoreState::with_parts(dir.path(), session_vault(), Arc::new(FakeConnector::new(EngineType::Postgres)))
            .unwrap();
        assert_eq!(state.config().query.default_row_limit, 25);
        assert_eq!(state.config().pool.max_size, 5);
    }

    #[test]
    fn test_malformed_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();
        let result = CoreState::with_parts(dir.path(), session_vault(), Arc::new(FakeConnector::new(EngineType::Postgres)));
        assert_eq!(result.err().map(|e| e.kind()), Some("Config"));
    }
}
