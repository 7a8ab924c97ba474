//! Error types for the MesaGrid core.
//!
//! Each component reports its own error enum. `CoreError` unifies them for
//! callers that span components, and `ErrorResponse` is the only shape that
//! crosses the command boundary.

use crate::models::DestructiveKind;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ========== Credential Vault ==========

/// Failure reported by the credential vault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    /// No secret is stored for the profile.
    #[error("No credential stored for connection {0}")]
    NotFound(Uuid),

    /// The OS secret store refused access.
    #[error("Access to the secret store was denied: {0}")]
    AccessDenied(String),

    /// The OS secret store could not be reached.
    #[error("Secret store unavailable: {0}")]
    BackendUnavailable(String),
}

impl VaultError {
    /// Variant name used across the command boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::AccessDenied(_) => "AccessDenied",
            Self::BackendUnavailable(_) => "BackendUnavailable",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NotFound(_) => Some("Edit the connection and re-enter the password"),
            Self::AccessDenied(_) => Some("Grant MesaGrid access to the system keychain"),
            Self::BackendUnavailable(_) => Some("Check that the system secret service is running"),
        }
    }
}

// ========== Connection Pool Manager ==========

/// Failure to obtain a usable database connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The server rejected the credentials. Never retried.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The server could not be reached, or the connection dropped twice in a row.
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    /// Opening a physical connection took longer than the connect timeout.
    #[error("Connection timed out: {0}")]
    Timeout(String),

    /// Every pooled connection stayed borrowed for the whole wait bound.
    #[error("Connection pool exhausted ({max_size} connections in use, {waiting} waiting)")]
    Exhausted {
        /// Configured pool size.
        max_size: usize,
        /// Tasks waiting for a connection when the wait expired.
        waiting: usize,
    },

    /// No profile is registered under the id.
    #[error("Connection profile not found: {0}")]
    ProfileNotFound(Uuid),

    /// The profile's password could not be read from the vault.
    #[error("Credential unavailable: {0}")]
    Credential(#[from] VaultError),
}

impl ConnectionError {
    /// Variant name used across the command boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthFailed(_) => "AuthFailed",
            Self::Unreachable(_) => "Unreachable",
            Self::Timeout(_) => "Timeout",
            Self::Exhausted { .. } => "Exhausted",
            Self::ProfileNotFound(_) => "ProfileNotFound",
            Self::Credential(err) => err.kind(),
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::AuthFailed(_) => Some("Check username and password"),
            Self::Unreachable(_) => Some("Check that the database server is running and reachable"),
            Self::Timeout(_) => Some("The server is slow to respond; check network latency"),
            Self::Exhausted { .. } => Some("Wait for running queries to finish or cancel one"),
            Self::ProfileNotFound(_) => Some("The connection may have been deleted"),
            Self::Credential(err) => err.hint(),
        }
    }

    /// Whether one transparent retry against a fresh connection is allowed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

// ========== Query Executor / Pager / Introspector ==========

/// Failure while running a statement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The engine refused the statement (syntax, permission, constraint).
    #[error("{message}")]
    Rejected {
        /// Engine-reported message.
        message: String,
        /// SQLSTATE (PostgreSQL) or server error number (MySQL).
        code: Option<String>,
    },

    /// The query was cancelled by its token.
    #[error("Query cancelled")]
    Cancelled,

    /// A destructive statement was submitted without confirmation.
    #[error("Statement requires confirmation: {0}")]
    ConfirmationRequired(DestructiveKind),

    /// The statement ran longer than the configured statement timeout.
    #[error("Query exceeded the statement timeout of {timeout_ms}ms")]
    Timeout {
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// A pagination cursor was malformed or minted for another table.
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// No usable connection could be obtained.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl QueryError {
    /// Create a rejected error without an engine code.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected { message: message.into(), code: None }
    }

    /// Variant name used across the command boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "Rejected",
            Self::Cancelled => "Cancelled",
            Self::ConfirmationRequired(_) => "ConfirmationRequired",
            Self::Timeout { .. } => "Timeout",
            Self::InvalidCursor(_) => "InvalidCursor",
            Self::Connection(err) => err.kind(),
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Rejected { .. } => None,
            Self::Cancelled => None,
            Self::ConfirmationRequired(_) => Some("Confirm the statement to run it anyway"),
            Self::Timeout { .. } => Some("Add a WHERE clause or raise the statement timeout"),
            Self::InvalidCursor(_) => Some("Reload the table from the first page"),
            Self::Connection(err) => err.hint(),
        }
    }

    /// Check if this error represents a cancelled query.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// ========== Mutation Engine ==========

/// Failure of a single-row mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    /// The table has no primary key, or the request's key does not match it.
    #[error("Table {table} has no primary key matching the request")]
    NoPrimaryKey {
        /// Qualified table name.
        table: String,
    },

    /// The statement affected a number of rows other than one.
    #[error("Expected exactly one row to change, engine reported {affected}")]
    ConcurrentModification {
        /// Rows reported by the engine.
        affected: u64,
    },

    /// A unique, foreign-key, not-null or check constraint failed.
    #[error("Constraint violation: {message}")]
    ConstraintViolation {
        /// Engine-reported message.
        message: String,
        /// SQLSTATE or server error number.
        code: Option<String>,
    },

    /// The request referenced a column the table does not have.
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    /// The engine refused the statement for another reason.
    #[error("{message}")]
    Rejected {
        /// Engine-reported message.
        message: String,
        /// SQLSTATE or server error number.
        code: Option<String>,
    },

    /// No usable connection could be obtained.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl MutationError {
    /// Variant name used across the command boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoPrimaryKey { .. } => "NoPrimaryKey",
            Self::ConcurrentModification { .. } => "ConcurrentModification",
            Self::ConstraintViolation { .. } => "ConstraintViolation",
            Self::UnknownColumn(_) => "UnknownColumn",
            Self::Rejected { .. } => "Rejected",
            Self::Connection(err) => err.kind(),
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NoPrimaryKey { .. } => Some("Add a primary key to edit rows of this table"),
            Self::ConcurrentModification { .. } => Some("Refresh the table; the row changed or disappeared"),
            Self::ConstraintViolation { .. } => None,
            Self::UnknownColumn(_) => Some("Refresh the table schema"),
            Self::Rejected { .. } => None,
            Self::Connection(err) => err.hint(),
        }
    }
}

// ========== Unified Error ==========

/// Error type for operations spanning several components.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Credential vault failure.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Connection failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Query failure.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Mutation failure.
    #[error(transparent)]
    Mutation(#[from] MutationError),

    /// Input validation failure.
    #[error("Validation error: {message}")]
    Validation {
        /// Human-readable error message.
        message: String,
    },

    /// Local metadata storage failure.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration file failure.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },
}

impl CoreError {
    // ========== Constructors ==========

    /// Create a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into(), source: None }
    }

    /// Create a new storage error with source.
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    // ========== Methods ==========

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Vault(_) => "Vault",
            Self::Connection(_) => "Connection",
            Self::Query(QueryError::Connection(_)) => "Connection",
            Self::Query(_) => "Query",
            Self::Mutation(MutationError::Connection(_)) => "Connection",
            Self::Mutation(_) => "Mutation",
            Self::Validation { .. } => "Validation",
            Self::Storage { .. } => "Storage",
            Self::Config { .. } => "Config",
        }
    }

    /// Variant name used across the command boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Vault(err) => err.kind(),
            Self::Connection(err) => err.kind(),
            Self::Query(err) => err.kind(),
            Self::Mutation(err) => err.kind(),
            Self::Validation { .. } => "Validation",
            Self::Storage { .. } => "Storage",
            Self::Config { .. } => "Config",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Vault(err) => err.hint(),
            Self::Connection(err) => err.hint(),
            Self::Query(err) => err.hint(),
            Self::Mutation(err) => err.hint(),
            Self::Validation { .. } => None,
            Self::Storage { .. } => Some("The local database may be corrupted"),
            Self::Config { .. } => Some("Fix or remove config.json in the data directory"),
        }
    }

    /// Engine error code, when the engine reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Query(QueryError::Rejected { code, .. })
            | Self::Mutation(MutationError::Rejected { code, .. })
            | Self::Mutation(MutationError::ConstraintViolation { code, .. }) => code.as_deref(),
            _ => None,
        }
    }

    /// Convert to the structured response sent across the command boundary.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            category: self.category().to_string(),
            kind: self.kind().to_string(),
            message: self.to_string(),
            hint: self.hint().map(String::from),
            code: self.code().map(String::from),
        }
    }
}

/// Structured error returned by every command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Component family (e.g. "Connection", "Query").
    pub category: String,
    /// Variant name (e.g. "Unreachable", "ConfirmationRequired").
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Actionable suggestion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Engine error code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<CoreError> for ErrorResponse {
    fn from(err: CoreError) -> Self {
        err.to_response()
    }
}

macro_rules! response_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ErrorResponse {
                fn from(err: $ty) -> Self {
                    CoreError::from(err).to_response()
                }
            }
        )*
    };
}

response_from!(VaultError, ConnectionError, QueryError, MutationError);

// ========== Error Conversions ==========

/// Convert from rusqlite::Error to CoreError.
impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::storage_with_source(err.to_string(), err)
    }
}

/// Convert from std::io::Error to CoreError.
impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::storage_with_source(err.to_string(), err)
    }
}
