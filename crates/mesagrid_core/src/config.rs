//! Runtime configuration.
//!
//! Loaded from `config.json` in the data directory. Every field has a default,
//! so a missing file or a partial file are both valid.

use crate::error::CoreError;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "MESAGRID_DATA_DIR";

/// File name of the configuration inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// How idle connections are health-checked before reuse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecyclingMethod {
    /// Check that the socket is still open
    #[default]
    Fast,
    /// Run a round-trip ping
    Verified,
}

/// Per-profile pool sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept open while the pool exists
    pub min_size: usize,
    /// Upper bound on physical connections
    pub max_size: usize,
    /// How long an acquire waits on an exhausted pool
    pub wait_timeout_ms: u64,
    /// How long opening one physical connection may take
    pub connect_timeout_ms: u64,
    /// Idle connections beyond `min_size` are closed after this long
    pub idle_timeout_secs: u64,
    /// Health check before handing out an idle connection
    pub recycling: RecyclingMethod,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 5,
            wait_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            idle_timeout_secs: 300,
            recycling: RecyclingMethod::Fast,
        }
    }
}

impl PoolConfig {
    /// Acquire wait bound.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Physical connect bound.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle reap threshold.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// How often the reaper scans, half the idle timeout, at least one second.
    pub fn reap_interval(&self) -> Duration {
        (self.idle_timeout() / 2).max(Duration::from_secs(1))
    }
}

/// Ad-hoc query bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Rows returned when the caller gives no limit
    pub default_row_limit: usize,
    /// Largest limit a caller may request
    pub max_row_limit: usize,
    /// Time allowed for an engine to confirm a cancel
    pub cancel_grace_ms: u64,
    /// Optional per-statement time limit
    pub statement_timeout_ms: Option<u64>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_row_limit: 100,
            max_row_limit: 10_000,
            cancel_grace_ms: 2_000,
            statement_timeout_ms: None,
        }
    }
}

impl QueryConfig {
    /// Effective limit for a request. Always bounded.
    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(0) | None => self.default_row_limit,
            Some(n) => n.min(self.max_row_limit),
        }
    }

    /// Cancel confirmation bound.
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Statement time limit, if configured.
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }
}

/// Schema cache policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Cached catalog data expires after this long; `None` keeps it until invalidated
    pub cache_ttl_secs: Option<u64>,
}

/// Table browsing bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagerConfig {
    /// Rows per page when the caller gives none
    pub default_page_size: usize,
    /// Largest page a caller may request
    pub max_page_size: usize,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self { default_page_size: 100, max_page_size: 1_000 }
    }
}

impl PagerConfig {
    /// Effective page size for a request.
    pub fn effective_page_size(&self, requested: usize) -> usize {
        if requested == 0 {
            self.default_page_size
        } else {
            requested.min(self.max_page_size)
        }
    }
}

/// Complete core configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Pool settings applied to every profile
    pub pool: PoolConfig,
    /// Ad-hoc query settings
    pub query: QueryConfig,
    /// Schema cache settings
    pub schema: SchemaConfig,
    /// Table browsing settings
    pub pager: PagerConfig,
}

impl CoreConfig {
    /// Load `config.json` from the data directory, or defaults when absent.
    pub fn load(data_dir: &Path) -> Result<Self, CoreError> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            CoreError::config(format!("Invalid config file '{}': {e}", path.display()))
        })?;
        config.validate()?;

        tracing::info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.pool.max_size == 0 {
            return Err(CoreError::config("pool.max_size must be at least 1"));
        }
        if self.pool.min_size == 0 || self.pool.min_size > self.pool.max_size {
            return Err(CoreError::config("pool.min_size must be between 1 and pool.max_size"));
        }
        if self.query.default_row_limit == 0
            || self.query.default_row_limit > self.query.max_row_limit
        {
            return Err(CoreError::config(
                "query.default_row_limit must be between 1 and query.max_row_limit",
            ));
        }
        if self.pager.default_page_size == 0
            || self.pager.default_page_size > self.pager.max_page_size
        {
            return Err(CoreError::config(
                "pager.default_page_size must be between 1 and pager.max_page_size",
            ));
        }
        Ok(())
    }
}

/// Get the default data directory for the application.
///
/// `MESAGRID_DATA_DIR` wins. Debug builds use `./mesagrid_data`; release builds
/// use the platform data directory.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    #[cfg(debug_assertions)]
    {
        PathBuf::from("./mesagrid_data")
    }

    #[cfg(not(debug_assertions))]
    {
        dirs::data_dir()
            .map(|d| d.join("mesagrid"))
            .unwrap_or_else(|| PathBuf::from("./mesagrid_data"))
    }
}

/// Initialize the data directory, creating it if needed.
pub fn init_data_dir(path: &Path) -> Result<(), CoreError> {
    if path.exists() {
        if !path.is_dir() {
            return Err(CoreError::storage(format!(
                "Data path exists but is not a directory: {}",
                path.display()
            )));
        }
        return Ok(());
    }

    std::fs::create_dir_all(path).map_err(|e| {
        CoreError::storage_with_source(
            format!("Failed to create data directory '{}'", path.display()),
            e,
        )
    })?;

    tracing::info!(path = %path.display(), "Created data directory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = CoreConfig::load(dir.path()).unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.pool.max_size, 5);
        assert_eq!(config.query.default_row_limit, 100);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"pool": {"max_size": 8, "recycling": "verified"}, "query": {"statement_timeout_ms": 30000}}"#,
        )
        .unwrap();

        let config = CoreConfig::load(dir.path()).unwrap();
        assert_eq!(config.pool.max_size, 8);
        assert_eq!(config.pool.min_size, 1);
        assert_eq!(config.pool.recycling, RecyclingMethod::Verified);
        assert_eq!(config.query.statement_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.pager.default_page_size, 100);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        let err = CoreConfig::load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "Config");
    }

    #[test]
    fn test_min_above_max_is_rejected() {
        let mut config = CoreConfig::default();
        config.pool.min_size = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_limit_is_always_bounded() {
        let query = QueryConfig::default();
        assert_eq!(query.effective_limit(None), 100);
        assert_eq!(query.effective_limit(Some(0)), 100);
        assert_eq!(query.effective_limit(Some(5)), 5);
        assert_eq!(query.effective_limit(Some(usize::MAX)), 10_000);
    }

    #[test]
    fn test_reap_interval_has_floor() {
        let pool = PoolConfig { idle_timeout_secs: 1, ..Default::default() };
        assert_eq!(pool.reap_interval(), Duration::from_secs(1));
        assert_eq!(PoolConfig::default().reap_interval(), Duration::from_secs(150));
    }
}
