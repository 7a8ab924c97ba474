//! Query execution models.

use crate::models::schema::ColumnMetadata;
use crate::models::value::Row;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Kind of irreversible operation a statement performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestructiveKind {
    /// DROP of any object
    Drop,
    /// TRUNCATE
    Truncate,
    /// DELETE without a top-level WHERE
    DeleteWithoutWhere,
    /// UPDATE without a top-level WHERE
    UpdateWithoutWhere,
    /// ALTER that drops or retypes a column
    AlterDestructive,
}

impl std::fmt::Display for DestructiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Safety classification of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", content = "kind")]
pub enum Classification {
    /// No confirmation needed.
    Safe,
    /// Must be confirmed before execution.
    Destructive(DestructiveKind),
}

impl Classification {
    /// Check if the statement needs confirmation.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Destructive(_))
    }
}

/// Leading verb of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    /// SELECT, WITH ... SELECT, TABLE, VALUES
    Select,
    /// INSERT
    Insert,
    /// UPDATE
    Update,
    /// DELETE
    Delete,
    /// CREATE, ALTER, DROP, TRUNCATE, RENAME, COMMENT
    Ddl,
    /// Anything else (SHOW, SET, EXPLAIN, CALL, ...)
    Other,
}

/// Request to run one ad-hoc statement. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Profile to run against
    pub profile_id: Uuid,
    /// SQL text
    pub sql: String,
    /// Maximum rows to return; `None` or 0 uses the configured default
    pub limit: Option<usize>,
    /// Rows to skip before the first returned row
    pub offset: usize,
    /// Caller-chosen id for `cancel_query`
    pub query_id: Option<Uuid>,
    /// External cancellation signal
    pub cancel_token: Option<CancellationToken>,
}

impl QueryRequest {
    /// Create a request with default limit and no offset.
    pub fn new(profile_id: Uuid, sql: impl Into<String>) -> Self {
        Self {
            profile_id,
            sql: sql.into(),
            limit: None,
            offset: 0,
            query_id: None,
            cancel_token: None,
        }
    }

    /// Set the row limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the row offset.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the query id used for cancellation.
    pub fn with_query_id(mut self, id: Uuid) -> Self {
        self.query_id = Some(id);
        self
    }

    /// Attach an external cancellation token.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

/// Results from query execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Id the query ran under
    pub query_id: Uuid,
    /// Column metadata in engine order
    pub columns: Vec<ColumnMetadata>,
    /// Rows in engine order, at most the effective limit
    pub rows: Vec<Row>,
    /// Number of rows in this batch
    pub row_count: usize,
    /// Dispatch to last row received
    pub execution_time_ms: u64,
    /// Leading verb of the statement
    pub statement_kind: StatementKind,
    /// Rows changed by DML, when the engine reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    /// More rows existed beyond the limit
    pub truncated: bool,
}

/// Handle for tracking and cancelling a running query.
pub struct QueryHandle {
    /// Unique query identifier
    id: Uuid,
    /// Associated profile
    profile_id: Uuid,
    /// The SQL being executed
    sql: String,
    /// Cancellation token for interrupting the query
    cancel_token: CancellationToken,
    /// Execution start time
    started_at: DateTime<Utc>,
}

impl QueryHandle {
    /// Create a new query handle.
    pub fn new(id: Uuid, profile_id: Uuid, sql: impl Into<String>, token: CancellationToken) -> Self {
        Self { id, profile_id, sql: sql.into(), cancel_token: token, started_at: Utc::now() }
    }

    /// Get the unique query identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the associated profile ID.
    pub fn profile_id(&self) -> Uuid {
        self.profile_id
    }

    /// Get the SQL being executed.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    /// Request cancellation of the query.
    pub fn cancel(&self) {
        tracing::debug!(query_id = %self.id, "Cancellation requested");
        self.cancel_token.cancel();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Wait for cancellation.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await
    }

    /// Summary for listing running queries.
    pub fn info(&self) -> ActiveQuery {
        ActiveQuery {
            query_id: self.id,
            profile_id: self.profile_id,
            sql_preview: sql_preview(&self.sql, 120),
            started_at: self.started_at,
            elapsed_ms: self.elapsed_ms(),
        }
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.id)
            .field("profile_id", &self.profile_id)
            .field("sql", &sql_preview(&self.sql, 120))
            .field("started_at", &self.started_at)
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A running query, as listed by `active_queries`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveQuery {
    /// Query id
    pub query_id: Uuid,
    /// Profile the query runs against
    pub profile_id: Uuid,
    /// First characters of the SQL
    pub sql_preview: String,
    /// When execution started
    pub started_at: DateTime<Utc>,
    /// Milliseconds since start
    pub elapsed_ms: i64,
}

/// Truncate SQL for logs and listings, on a char boundary.
pub fn sql_preview(sql: &str, max_chars: usize) -> String {
    let trimmed = sql.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
