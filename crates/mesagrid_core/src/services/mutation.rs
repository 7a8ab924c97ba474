//! Single-row edits keyed by primary key.
//!
//! Values are always bound as parameters. Updates and deletes run inside a
//! transaction that is only committed when exactly one row changed.

use crate::engine::{dialect, EngineError};
use crate::error::{MutationError, QueryError};
use crate::models::{
    ColumnDetail, EngineType, KeyPart, MutationChange, MutationRequest, MutationResult, TableRef, Value,
};
use crate::services::pool::PooledConnection;
use crate::services::registry::ConnectionRegistry;
use crate::services::schema::{primary_key_of, SchemaIntrospector};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Builds and runs parameterized insert, update and delete statements.
pub struct MutationEngine {
    registry: Arc<ConnectionRegistry>,
    schema: Arc<SchemaIntrospector>,
}

impl MutationEngine {
    pub fn new(registry: Arc<ConnectionRegistry>, schema: Arc<SchemaIntrospector>) -> Self {
        Self { registry, schema }
    }

    /// Insert one row.
    pub async fn insert_row(&self, request: &MutationRequest) -> Result<MutationResult, MutationError> {
        self.check_operation(request, "insert")?;
        self.apply(request).await
    }

    /// Set one column of the row identified by the request's key.
    pub async fn update_cell(&self, request: &MutationRequest) -> Result<MutationResult, MutationError> {
        self.check_operation(request, "update")?;
        self.apply(request).await
    }

    /// Delete the row identified by the request's key.
    pub async fn delete_row(&self, request: &MutationRequest) -> Result<MutationResult, MutationError> {
        self.check_operation(request, "delete")?;
        self.apply(request).await
    }

    fn check_operation(&self, request: &MutationRequest, operation: &str) -> Result<(), MutationError> {
        if request.operation() == operation {
            Ok(())
        } else {
            Err(MutationError::Rejected {
                message: format!("{} request cannot run as {operation}", request.operation()),
                code: None,
            })
        }
    }

    /// Validate the request against the catalog and run it.
    pub async fn apply(&self, request: &MutationRequest) -> Result<MutationResult, MutationError> {
        let engine = self.registry.get(request.profile_id)?.engine;
        let columns = self
            .schema
            .column_details(request.profile_id, &request.table)
            .await
            .map_err(from_query_error)?;

        let (sql, params, guarded) = match &request.change {
            MutationChange::Insert { values } => {
                let (sql, params) = insert_statement(engine, &request.table, &columns, values)?;
                (sql, params, false)
            }
            MutationChange::UpdateCell { column, value } => {
                require_key(&request.table, &columns, &request.key)?;
                ensure_column(&columns, column)?;
                let target = dialect::quote_ident(engine, column);
                let mut params = vec![value.clone()];
                let predicate = key_predicate(engine, &request.key, &mut params);
                let sql = format!(
                    "UPDATE {} SET {target} = {} WHERE {predicate}",
                    dialect::qualified_table(engine, &request.table),
                    dialect::placeholder(engine, 1)
                );
                (sql, params, true)
            }
            MutationChange::Delete => {
                require_key(&request.table, &columns, &request.key)?;
                let mut params = Vec::with_capacity(request.key.len());
                let predicate = key_predicate(engine, &request.key, &mut params);
                let sql = format!(
                    "DELETE FROM {} WHERE {predicate}",
                    dialect::qualified_table(engine, &request.table)
                );
                (sql, params, true)
            }
        };

        let pool = self.registry.pool_for(request.profile_id).await?;
        let mut conn = pool.get().await?;

        let started = Instant::now();
        let affected = if guarded {
            guarded_execute(&mut conn, engine, &sql, &params).await
        } else {
            conn.execute(&sql, &params).await
        };
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let affected = match affected {
            Ok(n) => n,
            Err(err) => {
                if conn.is_closed() || err.is_connection_lost() {
                    conn.evict();
                }
                tracing::debug!(
                    connection_id = %request.profile_id,
                    table = %request.table,
                    operation = request.operation(),
                    error = %err,
                    "Mutation failed"
                );
                return Err(err.into());
            }
        };

        if affected != 1 {
            tracing::warn!(
                connection_id = %request.profile_id,
                table = %request.table,
                operation = request.operation(),
                affected,
                "Mutation did not change exactly one row"
            );
            return Err(MutationError::ConcurrentModification { affected });
        }

        tracing::info!(
            connection_id = %request.profile_id,
            table = %request.table,
            operation = request.operation(),
            execution_time_ms,
            "Row mutated"
        );
        Ok(MutationResult { rows_affected: 1, execution_time_ms })
    }
}

/// Run `sql` in a transaction, committing only a single-row change.
///
/// Any other count is rolled back and returned for the caller to report.
/// A failed rollback is reported as a lost connection so it gets evicted.
async fn guarded_execute(
    conn: &mut PooledConnection,
    engine: EngineType,
    sql: &str,
    params: &[Value],
) -> Result<u64, EngineError> {
    conn.execute(dialect::begin(engine), &[]).await?;

    let affected = match conn.execute(sql, params).await {
        Ok(n) => n,
        Err(err) => {
            if !err.is_connection_lost() {
                rollback(conn).await?;
            }
            return Err(err);
        }
    };

    if affected == 1 {
        conn.execute("COMMIT", &[]).await?;
    } else {
        rollback(conn).await?;
    }
    Ok(affected)
}

async fn rollback(conn: &mut PooledConnection) -> Result<(), EngineError> {
    match conn.execute("ROLLBACK", &[]).await {
        Ok(_) => Ok(()),
        Err(err) => {
            tracing::warn!(connection_id = %conn.profile_id(), error = %err, "Rollback failed");
            Err(EngineError::Unreachable(format!("rollback failed: {err}")))
        }
    }
}

fn insert_statement(
    engine: EngineType,
    table: &TableRef,
    columns: &[ColumnDetail],
    values: &[(String, Value)],
) -> Result<(String, Vec<Value>), MutationError> {
    let qualified = dialect::qualified_table(engine, table);
    if values.is_empty() {
        let sql = match engine {
            EngineType::Postgres => format!("INSERT INTO {qualified} DEFAULT VALUES"),
            EngineType::Mysql => format!("INSERT INTO {qualified} () VALUES ()"),
        };
        return Ok((sql, Vec::new()));
    }

    let mut seen = HashSet::new();
    for (column, _) in values {
        ensure_column(columns, column)?;
        if !seen.insert(column.as_str()) {
            return Err(MutationError::Rejected {
                message: format!("column {column} given more than once"),
                code: None,
            });
        }
    }

    let names: Vec<String> = values.iter().map(|(c, _)| dialect::quote_ident(engine, c)).collect();
    let placeholders: Vec<String> = (1..=values.len()).map(|i| dialect::placeholder(engine, i)).collect();
    let sql = format!(
        "INSERT INTO {qualified} ({}) VALUES ({})",
        names.join(", "),
        placeholders.join(", ")
    );
    Ok((sql, values.iter().map(|(_, v)| v.clone()).collect()))
}

/// `"k1" = $n AND "k2" = $n+1`, appending the key values to `params`.
fn key_predicate(engine: EngineType, key: &[KeyPart], params: &mut Vec<Value>) -> String {
    key.iter()
        .map(|part| {
            params.push(part.value.clone());
            format!(
                "{} = {}",
                dialect::quote_ident(engine, &part.column),
                dialect::placeholder(engine, params.len())
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// The supplied key columns must be exactly the table's primary key.
fn require_key(table: &TableRef, columns: &[ColumnDetail], key: &[KeyPart]) -> Result<(), MutationError> {
    let primary: HashSet<String> = primary_key_of(columns).into_iter().collect();
    let supplied: HashSet<&str> = key.iter().map(|k| k.column.as_str()).collect();

    let matches = !primary.is_empty()
        && supplied.len() == key.len()
        && supplied.len() == primary.len()
        && supplied.iter().all(|c| primary.contains(*c));
    if matches {
        Ok(())
    } else {
        Err(MutationError::NoPrimaryKey { table: table.qualified() })
    }
}

fn ensure_column(columns: &[ColumnDetail], column: &str) -> Result<(), MutationError> {
    if columns.iter().any(|c| c.name() == column) {
        Ok(())
    } else {
        Err(MutationError::UnknownColumn(column.to_string()))
    }
}

fn from_query_error(err: QueryError) -> MutationError {
    match err {
        QueryError::Connection(err) => MutationError::Connection(err),
        QueryError::Rejected { message, code } => MutationError::Rejected { message, code },
        other => MutationError::Rejected { message: other.to_string(), code: None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::models::{ProfileDraft, Secret};
    use crate::services::pool::PoolManager;
    use crate::services::storage::LocalStorage;
    use crate::test_support::{catalog_reply, column_row, session_vault, FakeConnector, Reply};
    use uuid::Uuid;

    struct Harness {
        connector: FakeConnector,
        registry: Arc<ConnectionRegistry>,
        engine: MutationEngine,
        profile_id: Uuid,
    }

    fn harness(handler: impl Fn(&str, &[Value]) -> Reply + Send + Sync + 'static) -> Harness {
        let connector = FakeConnector::with_handler(EngineType::Postgres, handler);
        let vault = session_vault();
        let pools = Arc::new(PoolManager::new(Arc::new(connector.clone()), vault.clone(), PoolConfig::default()));
        let registry = Arc::new(ConnectionRegistry::new(LocalStorage::open_in_memory().unwrap(), vault, pools));
        let profile = registry
            .create(ProfileDraft::new("Local", EngineType::Postgres, "db", "app", "me"), &Secret::new("pw"))
            .unwrap();
        let schema = Arc::new(SchemaIntrospector::new(registry.clone(), None));
        let engine = MutationEngine::new(registry.clone(), schema);
        Harness { connector, registry, engine, profile_id: profile.id }
    }

    /// `public.users(id pk, email)` and keyless `public.events(payload)`;
    /// every DML statement reports `affected` rows.
    fn tables(affected: u64) -> impl Fn(&str, &[Value]) -> Reply + Send + Sync + 'static {
        move |sql, params| {
            if sql.contains("pg_catalog.pg_attribute") {
                return match params.get(1).and_then(Value::as_str) {
                    Some("users") => catalog_reply(vec![
                        column_row("id", "integer", false, true, true, 1),
                        column_row("email", "text", true, false, true, 2),
                    ]),
                    Some("events") => catalog_reply(vec![column_row("payload", "jsonb", true, false, false, 1)]),
                    _ => catalog_reply(Vec::new()),
                };
            }
            if sql.starts_with("UPDATE") || sql.starts_with("DELETE") || sql.starts_with("INSERT") {
                return Reply::Affected(affected);
            }
            Reply::Affected(0)
        }
    }

    fn users() -> TableRef {
        TableRef::new("public", "users")
    }

    fn dml(connector: &FakeConnector) -> Vec<(String, Vec<Value>)> {
        connector
            .statements_with_params()
            .into_iter()
            .filter(|(sql, _)| !sql.contains("pg_catalog"))
            .collect()
    }

    #[tokio::test]
    async fn test_update_cell_is_parameterized_and_committed() {
        let h = harness(tables(1));
        let request = MutationRequest::update_cell(
            h.profile_id,
            users(),
            vec![KeyPart::new("id", 7i64)],
            "email",
            "a'; DROP TABLE users; --",
        );
        let result = h.engine.update_cell(&request).await.unwrap();
        assert_eq!(result.rows_affected, 1);

        let statements = dml(&h.connector);
        assert_eq!(statements[0].0, "BEGIN");
        assert_eq!(statements[1].0, "UPDATE \"public\".\"users\" SET \"email\" = $1 WHERE \"id\" = $2");
        assert_eq!(
            statements[1].1,
            vec![Value::Text("a'; DROP TABLE users; --".into()), Value::Integer(7)]
        );
        assert_eq!(statements[2].0, "COMMIT");
    }

    #[tokio::test]
    async fn test_zero_rows_rolls_back() {
        let h = harness(tables(0));
        let request = MutationRequest::delete(h.profile_id, users(), vec![KeyPart::new("id", 7i64)]);
        let err = h.engine.delete_row(&request).await.unwrap_err();
        assert_eq!(err, MutationError::ConcurrentModification { affected: 0 });

        let statements: Vec<String> = dml(&h.connector).into_iter().map(|(s, _)| s).collect();
        assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!statements.iter().any(|s| s == "COMMIT"));
    }

    #[tokio::test]
    async fn test_many_rows_rolls_back() {
        let h = harness(tables(2));
        let request = MutationRequest::update_cell(h.profile_id, users(), vec![KeyPart::new("id", 1i64)], "email", "x");
        let err = h.engine.update_cell(&request).await.unwrap_err();
        assert_eq!(err.kind(), "ConcurrentModification");
    }

    #[tokio::test]
    async fn test_keyless_table_is_refused_before_any_statement() {
        let h = harness(tables(1));
        let request = MutationRequest::update_cell(
            h.profile_id,
            TableRef::new("public", "events"),
            vec![KeyPart::new("payload", "{}")],
            "payload",
            "{\"a\":1}",
        );
        let err = h.engine.update_cell(&request).await.unwrap_err();
        assert!(matches!(err, MutationError::NoPrimaryKey { .. }));
        assert!(dml(&h.connector).is_empty());
    }

    #[tokio::test]
    async fn test_key_must_match_primary_key() {
        let h = harness(tables(1));
        let by_email = MutationRequest::delete(h.profile_id, users(), vec![KeyPart::new("email", "a@b.c")]);
        assert!(matches!(h.engine.delete_row(&by_email).await, Err(MutationError::NoPrimaryKey { .. })));

        let doubled = MutationRequest::delete(
            h.profile_id,
            users(),
            vec![KeyPart::new("id", 1i64), KeyPart::new("id", 2i64)],
        );
        assert!(matches!(h.engine.delete_row(&doubled).await, Err(MutationError::NoPrimaryKey { .. })));
        assert!(dml(&h.connector).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_column_is_refused() {
        let h = harness(tables(1));
        let request = MutationRequest::update_cell(h.profile_id, users(), vec![KeyPart::new("id", 1i64)], "nope", 1i64);
        assert_eq!(
            h.engine.update_cell(&request).await.unwrap_err(),
            MutationError::UnknownColumn("nope".into())
        );
    }

    #[tokio::test]
    async fn test_insert_binds_values() {
        let h = harness(tables(1));
        let request = MutationRequest::insert(
            h.profile_id,
            users(),
            vec![("id".into(), Value::Integer(9)), ("email".into(), Value::Null)],
        );
        h.engine.insert_row(&request).await.unwrap();

        let statements = dml(&h.connector);
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].0, "INSERT INTO \"public\".\"users\" (\"id\", \"email\") VALUES ($1, $2)");
        assert_eq!(statements[0].1, vec![Value::Integer(9), Value::Null]);
    }

    #[tokio::test]
    async fn test_insert_without_values_uses_defaults() {
        let h = harness(tables(1));
        let request = MutationRequest::insert(h.profile_id, users(), Vec::new());
        h.engine.insert_row(&request).await.unwrap();
        assert_eq!(dml(&h.connector)[0].0, "INSERT INTO \"public\".\"users\" DEFAULT VALUES");
    }

    #[tokio::test]
    async fn test_constraint_violation_rolls_back() {
        let h = harness(|sql, params| {
            if sql.starts_with("UPDATE") {
                return Reply::Fail(EngineError::Constraint {
                    message: "duplicate key value violates unique constraint".into(),
                    code: Some("23505".into()),
                });
            }
            tables(1)(sql, params)
        });
        let request = MutationRequest::update_cell(h.profile_id, users(), vec![KeyPart::new("id", 1i64)], "email", "dup");
        let err = h.engine.update_cell(&request).await.unwrap_err();
        assert!(matches!(err, MutationError::ConstraintViolation { code: Some(ref c), .. } if c == "23505"));
        assert_eq!(dml(&h.connector).last().map(|(s, _)| s.as_str()), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_lost_connection_is_evicted_not_retried() {
        let h = harness(|sql, params| {
            if sql.starts_with("DELETE") {
                return Reply::Fail(EngineError::Unreachable("server closed the connection".into()));
            }
            tables(1)(sql, params)
        });
        let request = MutationRequest::delete(h.profile_id, users(), vec![KeyPart::new("id", 1i64)]);
        let err = h.engine.delete_row(&request).await.unwrap_err();
        assert_eq!(err.kind(), "Unreachable");

        let deletes = dml(&h.connector).iter().filter(|(s, _)| s.starts_with("DELETE")).count();
        assert_eq!(deletes, 1);
        let pool = h.registry.pool_for(h.profile_id).await.unwrap();
        assert_eq!(pool.status().borrowed, 0);
    }

    #[tokio::test]
    async fn test_wrong_operation_is_rejected() {
        let h = harness(tables(1));
        let request = MutationRequest::delete(h.profile_id, users(), vec![KeyPart::new("id", 1i64)]);
        assert_eq!(h.engine.insert_row(&request).await.unwrap_err().kind(), "Rejected");
    }
}
