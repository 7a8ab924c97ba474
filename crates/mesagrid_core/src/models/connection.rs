//! Connection profile, secret and pool status models.

use crate::error::CoreError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Database engine a profile connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    /// PostgreSQL
    Postgres,
    /// MySQL or MariaDB
    Mysql,
}

impl EngineType {
    /// Convert to string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::Mysql),
            _ => None,
        }
    }

    /// Well-known server port.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Mysql => 3306,
        }
    }
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity fields of a profile, without identity or timestamps.
///
/// Used both to create a profile and to test settings ephemerally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDraft {
    /// Display name
    pub name: String,
    /// Engine type
    #[serde(rename = "type")]
    pub engine: EngineType,
    /// Server hostname or IP
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Login role
    pub username: String,
}

impl ProfileDraft {
    /// Create a draft using the engine's default port.
    pub fn new(
        name: impl Into<String>,
        engine: EngineType,
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            engine,
            host: host.into(),
            port: engine.default_port(),
            database: database.into(),
            username: username.into(),
        }
    }

    /// Set a non-default port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Validate the draft.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::validation("Connection name cannot be empty"));
        }
        if self.name.len() > 255 {
            return Err(CoreError::validation("Connection name cannot exceed 255 characters"));
        }
        if self.host.trim().is_empty() {
            return Err(CoreError::validation("Host cannot be empty"));
        }
        if self.port == 0 {
            return Err(CoreError::validation("Port must be between 1 and 65535"));
        }
        if self.database.trim().is_empty() {
            return Err(CoreError::validation("Database name cannot be empty"));
        }
        if self.database.len() > 64 {
            return Err(CoreError::validation("Database name cannot exceed 64 characters"));
        }
        if self.username.trim().is_empty() {
            return Err(CoreError::validation("Username cannot be empty"));
        }
        Ok(())
    }
}

/// Durable, non-secret metadata for one database connection.
///
/// Never holds a password; secrets live only in the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    /// Unique identifier, also the vault key
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Engine type
    #[serde(rename = "type")]
    pub engine: EngineType,
    /// Server hostname or IP
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Login role
    pub username: String,
    /// When the profile was saved
    pub created_at: DateTime<Utc>,
    /// When the profile was last edited
    pub updated_at: DateTime<Utc>,
    /// When a pool was last opened for the profile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl ConnectionProfile {
    /// Create a profile with a fresh id from a draft.
    pub fn from_draft(draft: ProfileDraft) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: draft.name,
            engine: draft.engine,
            host: draft.host,
            port: draft.port,
            database: draft.database,
            username: draft.username,
            created_at: now,
            updated_at: now,
            last_connected_at: None,
        }
    }

    /// Connectivity fields as a draft.
    pub fn draft(&self) -> ProfileDraft {
        ProfileDraft {
            name: self.name.clone(),
            engine: self.engine,
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            username: self.username.clone(),
        }
    }

    /// Apply a partial edit. Returns true when a connectivity field changed.
    pub fn apply(&mut self, patch: ProfilePatch) -> bool {
        let mut reconnect = false;
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(engine) = patch.engine {
            reconnect |= engine != self.engine;
            self.engine = engine;
        }
        if let Some(host) = patch.host {
            reconnect |= host != self.host;
            self.host = host;
        }
        if let Some(port) = patch.port {
            reconnect |= port != self.port;
            self.port = port;
        }
        if let Some(database) = patch.database {
            reconnect |= database != self.database;
            self.database = database;
        }
        if let Some(username) = patch.username {
            reconnect |= username != self.username;
            self.username = username;
        }
        self.updated_at = Utc::now();
        reconnect
    }

    /// Host and port for log fields.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Partial edit of a profile. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    /// New display name
    pub name: Option<String>,
    /// New engine type
    #[serde(rename = "type")]
    pub engine: Option<EngineType>,
    /// New host
    pub host: Option<String>,
    /// New port
    pub port: Option<u16>,
    /// New database
    pub database: Option<String>,
    /// New username
    pub username: Option<String>,
}

/// A database password.
///
/// Not `Serialize`; `Debug` prints a placeholder.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a password.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext for a driver handshake.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Connection pool status information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    /// Maximum pool size
    pub max_size: usize,
    /// Current number of physical connections
    pub size: usize,
    /// Idle connections (negative when tasks are waiting)
    pub available: isize,
    /// Tasks waiting for a connection
    pub waiting: usize,
    /// Connections currently handed out
    pub borrowed: usize,
}

/// Outcome of an ephemeral connection test. Always produced, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConnectionResult {
    /// Whether connect and the version round-trip succeeded
    pub success: bool,
    /// Error kind on failure (e.g. "Unreachable", "AuthFailed")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Server version string on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    /// Time spent connecting and round-tripping
    pub latency_ms: u64,
}

impl TestConnectionResult {
    /// Successful test.
    pub fn ok(server_version: String, latency_ms: u64) -> Self {
        Self {
            success: true,
            error: None,
            message: None,
            server_version: Some(server_version),
            latency_ms,
        }
    }

    /// Failed test.
    pub fn failed(kind: &str, message: String, latency_ms: u64) -> Self {
        Self {
            success: false,
            error: Some(kind.to_string()),
            message: Some(message),
            server_version: None,
            latency_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> ProfileDraft {
        ProfileDraft::new("Local", EngineType::Postgres, "localhost", "app", "postgres")
    }

    #[test]
    fn test_engine_type_round_trips_strings() {
        assert_eq!(EngineType::parse("PostgreSQL"), Some(EngineType::Postgres));
        assert_eq!(EngineType::parse("mysql"), Some(EngineType::Mysql));
        assert_eq!(EngineType::parse("oracle"), None);
        assert_eq!(EngineType::Mysql.default_port(), 3306);
    }

    #[test]
    fn test_draft_validation() {
        assert!(draft().validate().is_ok());
        assert!(ProfileDraft { host: " ".into(), ..draft() }.validate().is_err());
        assert!(draft().with_port(0).validate().is_err());
        assert!(ProfileDraft { database: "x".repeat(65), ..draft() }.validate().is_err());
        assert!(ProfileDraft { username: String::new(), ..draft() }.validate().is_err());
    }

    #[test]
    fn test_profile_serializes_without_secret() {
        let profile = ConnectionProfile::from_draft(draft());
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["type"], "postgres");
        assert_eq!(json["port"], 5432);
        assert!(json.get("password").is_none());
        assert!(json.get("lastConnectedAt").is_none());
    }

    #[test]
    fn test_patch_reports_connectivity_change() {
        let mut profile = ConnectionProfile::from_draft(draft());
        let renamed = profile.apply(ProfilePatch { name: Some("Renamed".into()), ..Default::default() });
        assert!(!renamed);
        assert_eq!(profile.name, "Renamed");

        let moved = profile.apply(ProfilePatch { port: Some(6543), ..Default::default() });
        assert!(moved);
        assert_eq!(profile.port, 6543);

        let same_host = profile.apply(ProfilePatch { host: Some("localhost".into()), ..Default::default() });
        assert!(!same_host);
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }
}
