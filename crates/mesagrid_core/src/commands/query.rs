//! Ad-hoc query commands.

use super::parse_id;
use crate::error::ErrorResponse;
use crate::models::{ActiveQuery, Classification, QueryRequest, QueryResult};
use crate::services::guard;
use crate::state::CoreState;

use serde::Deserialize;

/// Input of [`execute_query`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteQueryRequest {
    /// Profile to run against
    pub connection_id: String,
    /// SQL text
    pub sql: String,
    /// Row limit; omitted or 0 uses the configured default
    #[serde(default)]
    pub limit: Option<usize>,
    /// Rows to skip
    #[serde(default)]
    pub offset: Option<usize>,
    /// The user confirmed a destructive statement
    #[serde(default)]
    pub confirmed: bool,
    /// Caller-chosen id for `cancel_query`
    #[serde(default)]
    pub query_id: Option<String>,
}

/// Run SQL and return a bounded result.
pub async fn execute_query(state: &CoreState, request: ExecuteQueryRequest) -> Result<QueryResult, ErrorResponse> {
    let connection_id = parse_id(&request.connection_id, "connection")?;
    let query_id = request.query_id.as_deref().map(|id| parse_id(id, "query")).transpose()?;

    let mut query = QueryRequest::new(connection_id, request.sql).with_offset(request.offset.unwrap_or(0));
    query.limit = request.limit;
    query.query_id = query_id;

    Ok(state.executor().execute(query, request.confirmed).await?)
}

/// Cancel a running query. Finished or unknown queries are a no-op.
pub fn cancel_query(state: &CoreState, query_id: &str) -> Result<(), ErrorResponse> {
    let id = parse_id(query_id, "query")?;
    if !state.executor().cancel(id) {
        tracing::debug!(query_id = %id, "Cancel requested for a query that is not running");
    }
    Ok(())
}

/// Running queries, optionally for one profile.
pub fn active_queries(state: &CoreState, connection_id: Option<&str>) -> Result<Vec<ActiveQuery>, ErrorResponse> {
    let filter = connection_id.map(|id| parse_id(id, "connection")).transpose()?;
    let mut queries = state.executor().active_queries();
    if let Some(id) = filter {
        queries.retain(|q| q.profile_id == id);
    }
    Ok(queries)
}

/// Classify SQL without running it, so the caller can ask for confirmation up front.
pub fn classify_statement(state: &CoreState, connection_id: &str, sql: &str) -> Result<Classification, ErrorResponse> {
    let id = parse_id(connection_id, "connection")?;
    let engine = state.registry().get(id)?.engine;
    Ok(guard::classify(sql, engine))
}
