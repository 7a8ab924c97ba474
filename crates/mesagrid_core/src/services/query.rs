//! Ad-hoc query execution with cancellation support.
//!
//! Provides query execution with:
//! - Destructive statement confirmation before any network round-trip
//! - A row bound on every result, even when the caller gives none
//! - Cancellation via tokio-util CancellationToken, confirmed with a
//!   protocol-level cancel before the connection is reused
//! - Optional statement timeout sharing the cancel path
//! - One retry on a fresh connection when the connection is lost

use crate::config::QueryConfig;
use crate::engine::{dialect, CancelHandle, EngineError, QuerySpec, RawResult};
use crate::error::QueryError;
use crate::models::{
    ActiveQuery, Classification, EngineType, QueryHandle, QueryRequest, QueryResult, Row,
    StatementKind,
};
use crate::services::guard;
use crate::services::pool::PooledConnection;
use crate::services::registry::ConnectionRegistry;
use crate::services::schema::SchemaIntrospector;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::select;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a running statement was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortReason {
    Cancelled,
    TimedOut,
}

/// How one attempt on one connection failed.
#[derive(Debug)]
enum Failure {
    /// The connection died; `retryable` when no statement had completed yet.
    Lost { error: EngineError, retryable: bool },
    /// The statement was aborted; `confirmed` once the engine acknowledged it.
    Aborted { reason: AbortReason, confirmed: bool },
    /// The engine refused a statement.
    Engine(EngineError),
}

/// Result of the final statement in a request.
struct Output {
    raw: RawResult,
    kind: StatementKind,
    ddl: bool,
}

/// Executes ad-hoc SQL against pooled connections.
pub struct QueryExecutor {
    registry: Arc<ConnectionRegistry>,
    schema: Arc<SchemaIntrospector>,
    config: QueryConfig,
    active: RwLock<HashMap<Uuid, Arc<QueryHandle>>>,
}

/// Removes a query from the active set when execution ends or is dropped.
struct ActiveGuard<'a> {
    executor: &'a QueryExecutor,
    query_id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if self.executor.active.write().remove(&self.query_id).is_some() {
            tracing::trace!(query_id = %self.query_id, "Query unregistered");
        }
    }
}

impl QueryExecutor {
    /// Create an executor.
    pub fn new(registry: Arc<ConnectionRegistry>, schema: Arc<SchemaIntrospector>, config: QueryConfig) -> Self {
        Self { registry, schema, config, active: RwLock::new(HashMap::new()) }
    }

    /// Run the request's SQL and return a bounded result.
    ///
    /// Destructive statements fail with `ConfirmationRequired` unless
    /// `confirmed` is set. With several statements, all but the last are run
    /// for their side effects and the last one's result is returned.
    pub async fn execute(&self, request: QueryRequest, confirmed: bool) -> Result<QueryResult, QueryError> {
        let profile = self.registry.get(request.profile_id)?;
        let engine = profile.engine;

        if let Classification::Destructive(kind) = guard::classify(&request.sql, engine) {
            if !confirmed {
                tracing::info!(connection_id = %profile.id, kind = %kind, "Destructive statement requires confirmation");
                return Err(QueryError::ConfirmationRequired(kind));
            }
        }

        let statements = guard::split_statements(&request.sql, engine);
        if statements.is_empty() {
            return Err(QueryError::rejected("No statement to execute"));
        }

        let query_id = request.query_id.unwrap_or_else(Uuid::new_v4);
        let token = request.cancel_token.clone().unwrap_or_default();
        let _active = self.register(QueryHandle::new(query_id, profile.id, request.sql.clone(), token.clone()))?;

        tracing::debug!(
            query_id = %query_id,
            connection_id = %profile.id,
            sql = %crate::models::query::sql_preview(&request.sql, 120),
            "Executing query"
        );

        let limit = self.config.effective_limit(request.limit);
        let pool = self.registry.pool_for(profile.id).await?;
        let mut retried = false;

        loop {
            let mut conn = select! {
                conn = pool.get() => conn?,
                _ = token.cancelled() => return Err(QueryError::Cancelled),
            };

            let started = Instant::now();
            let outcome = self.attempt(&mut conn, engine, &statements, limit, request.offset, &token).await;
            let execution_time_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(output) => {
                    drop(conn);
                    if output.ddl {
                        self.schema.invalidate(profile.id);
                    }
                    let result = build_result(query_id, output, execution_time_ms);
                    tracing::info!(
                        query_id = %query_id,
                        connection_id = %profile.id,
                        row_count = result.row_count,
                        execution_time_ms,
                        "Query completed"
                    );
                    return Ok(result);
                }
                Err(Failure::Lost { error, retryable }) => {
                    conn.evict();
                    if retryable && !retried {
                        retried = true;
                        tracing::warn!(query_id = %query_id, error = %error, "Connection lost, retrying query once");
                        continue;
                    }
                    return Err(error.into());
                }
                Err(Failure::Aborted { reason, confirmed }) => {
                    if confirmed {
                        drop(conn);
                    } else {
                        tracing::warn!(query_id = %query_id, "Cancel not confirmed within grace period, evicting connection");
                        conn.evict();
                    }
                    tracing::info!(query_id = %query_id, reason = ?reason, "Query aborted");
                    return Err(match reason {
                        AbortReason::Cancelled => QueryError::Cancelled,
                        AbortReason::TimedOut => QueryError::Timeout {
                            timeout_ms: self.config.statement_timeout_ms.unwrap_or_default(),
                        },
                    });
                }
                Err(Failure::Engine(error)) => {
                    if conn.is_closed() {
                        conn.evict();
                    }
                    tracing::debug!(query_id = %query_id, error = %error, "Query rejected");
                    return Err(error.into());
                }
            }
        }
    }

    async fn attempt(
        &self,
        conn: &mut PooledConnection,
        engine: EngineType,
        statements: &[&str],
        limit: usize,
        offset: usize,
        token: &CancellationToken,
    ) -> Result<Output, Failure> {
        let Some((last, earlier)) = statements.split_last() else {
            return Ok(Output { raw: RawResult::default(), kind: StatementKind::Other, ddl: false });
        };

        let mut ddl = false;
        for (completed, sql) in earlier.iter().enumerate() {
            let cancel = conn.cancel_handle();
            self.supervise(cancel, token, conn.execute(sql, &[]))
                .await
                .map_err(|f| f.retryable(completed == 0))?;
            ddl |= guard::statement_kind(sql, engine) == StatementKind::Ddl;
        }
        let retryable = earlier.is_empty();

        let kind = guard::statement_kind(last, engine);
        ddl |= kind == StatementKind::Ddl;

        let raw = if kind == StatementKind::Select {
            let windowed = dialect::window(last, limit + 1, offset);
            let cancel = conn.cancel_handle();
            let outcome = self.supervise(cancel, token, conn.query(QuerySpec::new(&windowed, limit))).await;
            match outcome {
                // Only a parse failure of the wrapper guarantees the statement never ran.
                Err(Failure::Engine(ref error)) if error.is_syntax_error() => {
                    tracing::debug!(error = %error, "Windowed select not parsed, running statement as written");
                    self.run_plain(conn, last, limit, offset, token).await.map_err(|f| f.retryable(retryable))?
                }
                other => other.map_err(|f| f.retryable(retryable))?,
            }
        } else {
            self.run_plain(conn, last, limit, offset, token).await.map_err(|f| f.retryable(retryable))?
        };

        Ok(Output { raw, kind, ddl })
    }

    async fn run_plain(
        &self,
        conn: &mut PooledConnection,
        sql: &str,
        limit: usize,
        offset: usize,
        token: &CancellationToken,
    ) -> Result<RawResult, Failure> {
        let cancel = conn.cancel_handle();
        let spec = QuerySpec::new(sql, limit).with_skip(offset);
        self.supervise(cancel, token, conn.query(spec)).await
    }

    /// Drive one statement while watching the token and the statement timeout.
    ///
    /// On abort, a protocol cancel is sent and the statement is given the
    /// grace period to finish; only then is the abort reported as confirmed.
    async fn supervise<T>(
        &self,
        cancel: Arc<dyn CancelHandle>,
        token: &CancellationToken,
        operation: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, Failure> {
        let mut operation = std::pin::pin!(operation);
        let timeout = self.config.statement_timeout();
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let reason = select! {
            result = &mut operation => {
                return result.map_err(|error| {
                    if error.is_connection_lost() {
                        Failure::Lost { error, retryable: true }
                    } else if error == EngineError::Cancelled {
                        Failure::Aborted { reason: AbortReason::Cancelled, confirmed: true }
                    } else {
                        Failure::Engine(error)
                    }
                });
            }
            _ = token.cancelled() => AbortReason::Cancelled,
            _ = deadline => AbortReason::TimedOut,
        };

        let grace = self.config.cancel_grace();
        let confirmed = tokio::time::timeout(grace, async {
            if let Err(err) = cancel.cancel().await {
                tracing::warn!(error = %err, "Protocol cancel request failed");
            }
            operation.await
        })
        .await
        .is_ok_and(|result| !matches!(result, Err(ref e) if e.is_connection_lost()));

        Err(Failure::Aborted { reason, confirmed })
    }

    fn register(&self, handle: QueryHandle) -> Result<ActiveGuard<'_>, QueryError> {
        let query_id = handle.id();
        let mut active = self.active.write();
        if active.contains_key(&query_id) {
            return Err(QueryError::rejected(format!("Query id {query_id} is already running")));
        }
        active.insert(query_id, Arc::new(handle));
        tracing::trace!(query_id = %query_id, "Query registered");
        Ok(ActiveGuard { executor: self, query_id })
    }

    /// Signal a running query's token. Unknown or finished ids are a no-op.
    ///
    /// Returns true if the query was found and cancellation was requested.
    pub fn cancel(&self, query_id: Uuid) -> bool {
        match self.active.read().get(&query_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of running queries.
    pub fn active_queries(&self) -> Vec<ActiveQuery> {
        let mut queries: Vec<_> = self.active.read().values().map(|h| h.info()).collect();
        queries.sort_by_key(|q| q.started_at);
        queries
    }
}

impl Failure {
    fn retryable(self, allowed: bool) -> Self {
        match self {
            Self::Lost { error, retryable } => Self::Lost { error, retryable: retryable && allowed },
            other => other,
        }
    }
}

fn build_result(query_id: Uuid, output: Output, execution_time_ms: u64) -> QueryResult {
    let names: Arc<[String]> = output.raw.columns.iter().map(|c| c.name.clone()).collect();
    let rows: Vec<Row> = output.raw.rows.into_iter().map(|values| Row::new(names.clone(), values)).collect();
    QueryResult {
        query_id,
        columns: output.raw.columns,
        row_count: rows.len(),
        rows,
        execution_time_ms,
        statement_kind: output.kind,
        rows_affected: output.raw.rows_affected,
        truncated: output.raw.more_available,
    }
}
