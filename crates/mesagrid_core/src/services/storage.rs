//! Local SQLite storage for connection metadata.
//!
//! Holds saved connection profiles only. Passwords are NOT stored here; they
//! live in the OS keychain behind the credential vault.

use crate::config::init_data_dir;
use crate::error::CoreError;
use crate::models::{ConnectionProfile, EngineType};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name of the metadata database inside the data directory.
const DB_FILE: &str = "mesagrid.db";

const PROFILE_COLUMNS: &str = "connection_id, name, engine, host, port, database_name, username,
     created_at, updated_at, last_connected_at";

/// SQLite-based metadata storage.
///
/// Thread-safe via internal Mutex. Uses WAL mode for concurrent reads.
pub struct LocalStorage {
    connection: Mutex<Connection>,
    data_dir: PathBuf,
}

impl LocalStorage {
    /// Open or create storage in the given data directory.
    pub fn open(data_dir: &Path) -> Result<Self, CoreError> {
        init_data_dir(data_dir)?;
        let db_path = data_dir.join(DB_FILE);
        let connection = Connection::open(&db_path).map_err(|e| {
            CoreError::storage_with_source(
                format!("Failed to open database '{}'", db_path.display()),
                e,
            )
        })?;
        let storage = Self::from_connection(connection, data_dir.to_path_buf())?;
        tracing::info!(path = %db_path.display(), "Local storage opened");
        Ok(storage)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, CoreError> {
        Self::from_connection(Connection::open_in_memory()?, PathBuf::new())
    }

    fn from_connection(connection: Connection, data_dir: PathBuf) -> Result<Self, CoreError> {
        Self::configure_connection(&connection)?;
        let storage = Self { connection: Mutex::new(connection), data_dir };
        storage.run_migrations()?;
        Ok(storage)
    }

    fn configure_connection(conn: &Connection) -> Result<(), CoreError> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            ",
        )
        .map_err(|e| CoreError::storage_with_source("Failed to configure database", e))
    }

    fn run_migrations(&self) -> Result<(), CoreError> {
        let conn = self.connection.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                domain TEXT NOT NULL,
                step INTEGER NOT NULL,
                migration TEXT NOT NULL,
                PRIMARY KEY(domain, step)
            ) STRICT",
            [],
        )?;

        const DOMAIN: &str = "core";
        let current_step: i64 = conn.query_row(
            "SELECT COALESCE(MAX(step), 0) FROM migrations WHERE domain = ?",
            [DOMAIN],
            |row| row.get(0),
        )?;

        if current_step < 1 {
            conn.execute_batch(
                "
                CREATE TABLE connections (
                    connection_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    engine TEXT NOT NULL,
                    host TEXT NOT NULL,
                    port INTEGER NOT NULL,
                    database_name TEXT NOT NULL,
                    username TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    last_connected_at TEXT
                ) STRICT;

                CREATE INDEX idx_connections_last_connected ON connections(last_connected_at DESC);
                ",
            )
            .map_err(|e| CoreError::storage_with_source("Migration 1 failed", e))?;

            conn.execute(
                "INSERT INTO migrations (domain, step, migration) VALUES (?, 1, 'initial_schema')",
                [DOMAIN],
            )?;
            tracing::info!("Applied migration 1: initial_schema");
        }

        Ok(())
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ========== Connection Operations ==========

    /// Insert or update a connection profile.
    pub fn save_connection(&self, profile: &ConnectionProfile) -> Result<(), CoreError> {
        let conn = self.connection.lock();
        conn.execute(
            "INSERT INTO connections (
                connection_id, name, engine, host, port, database_name, username,
                created_at, updated_at, last_connected_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(connection_id) DO UPDATE SET
                name = excluded.name,
                engine = excluded.engine,
                host = excluded.host,
                port = excluded.port,
                database_name = excluded.database_name,
                username = excluded.username,
                updated_at = excluded.updated_at",
            params![
                profile.id.to_string(),
                profile.name,
                profile.engine.as_str(),
                profile.host,
                profile.port,
                profile.database,
                profile.username,
                profile.created_at.to_rfc3339(),
                profile.updated_at.to_rfc3339(),
                profile.last_connected_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        tracing::debug!(connection_id = %profile.id, name = %profile.name, "Connection saved");
        Ok(())
    }

    /// Load a connection profile by ID.
    pub fn load_connection(&self, id: Uuid) -> Result<Option<ConnectionProfile>, CoreError> {
        let conn = self.connection.lock();
        let row = conn
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM connections WHERE connection_id = ?"),
                [id.to_string()],
                ProfileRow::from_row,
            )
            .optional()?;
        row.map(ProfileRow::into_profile).transpose()
    }

    /// Load all saved connection profiles, most recently used first.
    pub fn load_all_connections(&self) -> Result<Vec<ConnectionProfile>, CoreError> {
        let conn = self.connection.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM connections
             ORDER BY last_connected_at DESC NULLS LAST, name"
        ))?;
        let rows = stmt.query_map([], ProfileRow::from_row)?;

        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row?.into_profile()?);
        }
        Ok(profiles)
    }

    /// Delete a connection profile.
    pub fn delete_connection(&self, id: Uuid) -> Result<(), CoreError> {
        let conn = self.connection.lock();
        conn.execute("DELETE FROM connections WHERE connection_id = ?", [id.to_string()])?;
        tracing::debug!(connection_id = %id, "Connection deleted");
        Ok(())
    }

    /// Record that a pool was opened for the connection.
    pub fn update_last_connected(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), CoreError> {
        let conn = self.connection.lock();
        conn.execute(
            "UPDATE connections SET last_connected_at = ? WHERE connection_id = ?",
            params![at.to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }
}

/// Raw column values of one `connections` row.
struct ProfileRow {
    id: String,
    name: String,
    engine: String,
    host: String,
    port: u16,
    database: String,
    username: String,
    created_at: String,
    updated_at: String,
    last_connected_at: Option<String>,
}

impl ProfileRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            engine: row.get(2)?,
            host: row.get(3)?,
            port: row.get(4)?,
            database: row.get(5)?,
            username: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            last_connected_at: row.get(9)?,
        })
    }

    fn into_profile(self) -> Result<ConnectionProfile, CoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| CoreError::storage_with_source("Invalid connection ID", e))?;
        let engine = EngineType::parse(&self.engine)
            .ok_or_else(|| CoreError::storage(format!("Unknown engine '{}'", self.engine)))?;

        Ok(ConnectionProfile {
            id,
            name: self.name,
            engine,
            host: self.host,
            port: self.port,
            database: self.database,
            username: self.username,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            last_connected_at: self.last_connected_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::storage_with_source(format!("Invalid timestamp '{s}'"), e))
}
