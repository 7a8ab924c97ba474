//! Database engine drivers.
//!
//! Each engine implements [`EngineConnection`] over its native async driver.
//! Everything above this module is engine-agnostic: it sees typed [`Value`]s,
//! column metadata and a classified [`EngineError`].

pub mod dialect;
pub mod mysql;
pub mod postgres;

use crate::error::{ConnectionError, MutationError, QueryError};
use crate::models::{ColumnMetadata, EngineType, Secret, Value};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Driver failure, classified by what the caller can do about it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Credentials were rejected.
    #[error("{0}")]
    Auth(String),

    /// The socket could not be opened or was lost.
    #[error("{0}")]
    Unreachable(String),

    /// Connecting took too long.
    #[error("{0}")]
    Timeout(String),

    /// The server aborted the statement after a cancel request.
    #[error("statement cancelled")]
    Cancelled,

    /// Unique, foreign-key, not-null or check constraint failure.
    #[error("{message}")]
    Constraint {
        /// Engine-reported message
        message: String,
        /// SQLSTATE or server error number
        code: Option<String>,
    },

    /// Any other statement failure.
    #[error("{message}")]
    Rejected {
        /// Engine-reported message
        message: String,
        /// SQLSTATE or server error number
        code: Option<String>,
    },
}

impl EngineError {
    /// Rejected without an engine code.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected { message: message.into(), code: None }
    }

    /// The server could not parse the statement, so nothing ran.
    ///
    /// Postgres SQLSTATE `42601`, MySQL error 1064.
    pub fn is_syntax_error(&self) -> bool {
        matches!(self, Self::Rejected { code: Some(code), .. } if code == "42601" || code == "1064")
    }

    /// Whether the underlying connection must be discarded.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<EngineError> for ConnectionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Auth(msg) => Self::AuthFailed(msg),
            EngineError::Timeout(msg) => Self::Timeout(msg),
            EngineError::Unreachable(msg) => Self::Unreachable(msg),
            other => Self::Unreachable(other.to_string()),
        }
    }
}

impl From<EngineError> for QueryError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Cancelled => Self::Cancelled,
            EngineError::Constraint { message, code } | EngineError::Rejected { message, code } => {
                Self::Rejected { message, code }
            }
            other => Self::Connection(other.into()),
        }
    }
}

impl From<EngineError> for MutationError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Constraint { message, code } => Self::ConstraintViolation { message, code },
            EngineError::Rejected { message, code } => Self::Rejected { message, code },
            EngineError::Cancelled => Self::Rejected { message: "statement cancelled".into(), code: None },
            other => Self::Connection(other.into()),
        }
    }
}

/// Everything needed to open one physical connection.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// Engine to speak
    pub engine: EngineType,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database (PostgreSQL) or default schema (MySQL)
    pub database: String,
    /// Login name
    pub username: String,
    /// Login password
    pub password: Secret,
    /// Bound on the whole connect handshake
    pub connect_timeout: Duration,
}

/// One statement to run through [`EngineConnection::query`].
#[derive(Debug, Clone, Copy)]
pub struct QuerySpec<'a> {
    /// Statement text with engine placeholders
    pub sql: &'a str,
    /// Bound parameter values, in placeholder order
    pub params: &'a [Value],
    /// Rows to discard before collecting
    pub skip: usize,
    /// Rows to collect at most
    pub max_rows: usize,
}

impl<'a> QuerySpec<'a> {
    /// Unparameterized statement collecting up to `max_rows` rows.
    pub fn new(sql: &'a str, max_rows: usize) -> Self {
        Self { sql, params: &[], skip: 0, max_rows }
    }

    /// Bind parameters.
    pub fn with_params(mut self, params: &'a [Value]) -> Self {
        self.params = params;
        self
    }

    /// Discard leading rows client-side.
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }
}

/// Rows and counts as the driver produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResult {
    /// Result columns; empty for statements without a result set
    pub columns: Vec<ColumnMetadata>,
    /// Collected rows, each aligned with `columns`
    pub rows: Vec<Vec<Value>>,
    /// Rows changed by a DML statement
    pub rows_affected: Option<u64>,
    /// The server had more rows than `max_rows`
    pub more_available: bool,
}

/// A live connection to one database server.
#[async_trait]
pub trait EngineConnection: Send {
    /// Engine this connection speaks.
    fn engine(&self) -> EngineType;

    /// Run a statement and collect a bounded window of its rows.
    async fn query(&mut self, spec: QuerySpec<'_>) -> Result<RawResult, EngineError>;

    /// Run a statement and return the affected-row count.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, EngineError>;

    /// Round-trip check.
    async fn ping(&mut self) -> Result<(), EngineError>;

    /// Server version string.
    async fn server_version(&mut self) -> Result<String, EngineError>;

    /// Whether the socket is known to be gone.
    fn is_closed(&self) -> bool;

    /// Handle able to abort the statement currently running on this connection.
    fn cancel_handle(&self) -> Arc<dyn CancelHandle>;
}

/// Out-of-band statement abort.
#[async_trait]
pub trait CancelHandle: Send + Sync {
    /// Ask the server to abort the running statement. Best effort.
    async fn cancel(&self) -> Result<(), EngineError>;
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate.
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn EngineConnection>, EngineError>;
}

/// Connector backed by the native drivers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeConnector;

#[async_trait]
impl Connector for NativeConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn EngineConnection>, EngineError> {
        match target.engine {
            EngineType::Postgres => {
                let conn = postgres::PgConnection::connect(target).await?;
                Ok(Box::new(conn))
            }
            EngineType::Mysql => {
                let conn = mysql::MySqlConnection::connect(target).await?;
                Ok(Box::new(conn))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_maps_to_query_cancelled() {
        assert_eq!(QueryError::from(EngineError::Cancelled), QueryError::Cancelled);
    }

    #[test]
    fn test_constraint_maps_per_component() {
        let err = EngineError::Constraint { message: "dup".into(), code: Some("23505".into()) };
        assert!(matches!(
            MutationError::from(err.clone()),
            MutationError::ConstraintViolation { code: Some(ref c), .. } if c == "23505"
        ));
        assert!(matches!(QueryError::from(err), QueryError::Rejected { .. }));
    }

    #[test]
    fn test_syntax_errors_by_engine_code() {
        let pg = EngineError::Rejected { message: "syntax error".into(), code: Some("42601".into()) };
        let my = EngineError::Rejected { message: "parse error".into(), code: Some("1064".into()) };
        let denied = EngineError::Rejected { message: "permission denied".into(), code: Some("42501".into()) };
        assert!(pg.is_syntax_error());
        assert!(my.is_syntax_error());
        assert!(!denied.is_syntax_error());
        assert!(!EngineError::rejected("no code").is_syntax_error());
    }

    #[test]
    fn test_auth_is_connection_error() {
        let err = QueryError::from(EngineError::Auth("bad password".into()));
        assert_eq!(err.kind(), "AuthFailed");
        assert!(!EngineError::Auth("x".into()).is_connection_lost());
        assert!(EngineError::Unreachable("x".into()).is_connection_lost());
    }
}
