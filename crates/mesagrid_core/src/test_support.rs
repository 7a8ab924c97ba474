//! Scripted in-process engine used by unit tests.
//!
//! A [`FakeConnector`] hands out [`FakeConnection`]s that answer every
//! statement through a shared handler closure. Statements may hang until a
//! protocol cancel arrives, connects may be scripted to fail, and counters
//! record what the services did.

use crate::config::CoreConfig;
use crate::engine::{
    CancelHandle, ConnectTarget, Connector, EngineConnection, EngineError, QuerySpec, RawResult,
};
use crate::models::{ColumnMetadata, ConnectionProfile, EngineType, ProfileDraft, Secret, Value};
use crate::services::credentials::{CredentialVault, SessionCredentialsProvider};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// How the fake answers one statement.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// A result set.
    Rows { columns: Vec<ColumnMetadata>, rows: Vec<Vec<Value>> },
    /// A DML or DDL count.
    Affected(u64),
    /// A driver failure. Connection-lost errors close the connection.
    Fail(EngineError),
    /// Block until a protocol cancel arrives, then report `Cancelled`.
    Hang,
    /// Block forever, ignoring cancel requests.
    Stall,
}

impl Reply {
    /// Result set with integer-free column metadata built from names.
    pub(crate) fn rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self::Rows {
            columns: columns.iter().map(|c| ColumnMetadata::new(*c, "text", true)).collect(),
            rows,
        }
    }
}

type Handler = Arc<dyn Fn(&str, &[Value]) -> Reply + Send + Sync>;

struct FakeState {
    engine: EngineType,
    handler: RwLock<Handler>,
    connect_failures: Mutex<VecDeque<EngineError>>,
    statements: Mutex<Vec<(String, Vec<Value>)>>,
    connects: AtomicUsize,
    cancels: AtomicUsize,
    open: AtomicUsize,
}

/// Connector producing scripted connections.
#[derive(Clone)]
pub(crate) struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    pub(crate) fn new(engine: EngineType) -> Self {
        Self::with_handler(engine, |_, _| Reply::Affected(0))
    }

    pub(crate) fn with_handler(
        engine: EngineType,
        handler: impl Fn(&str, &[Value]) -> Reply + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Arc::new(FakeState {
                engine,
                handler: RwLock::new(Arc::new(handler)),
                connect_failures: Mutex::new(VecDeque::new()),
                statements: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
                open: AtomicUsize::new(0),
            }),
        }
    }

    /// Replace the statement handler for every connection.
    pub(crate) fn set_handler(
        &self,
        handler: impl Fn(&str, &[Value]) -> Reply + Send + Sync + 'static,
    ) {
        *self.state.handler.write() = Arc::new(handler);
    }

    /// Make the next connect attempt fail with `err`.
    pub(crate) fn fail_next_connect(&self, err: EngineError) {
        self.state.connect_failures.lock().push_back(err);
    }

    /// Physical connects attempted, successful or not.
    pub(crate) fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Protocol cancels issued.
    pub(crate) fn cancels(&self) -> usize {
        self.state.cancels.load(Ordering::SeqCst)
    }

    /// Connections currently alive.
    pub(crate) fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Every statement received, in order.
    pub(crate) fn statements(&self) -> Vec<String> {
        self.state.statements.lock().iter().map(|(sql, _)| sql.clone()).collect()
    }

    /// Every statement with its bound parameters.
    pub(crate) fn statements_with_params(&self) -> Vec<(String, Vec<Value>)> {
        self.state.statements.lock().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn EngineConnection>, EngineError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.state.connect_failures.lock().pop_front() {
            return Err(err);
        }
        if target.password.expose() == "wrong" {
            return Err(EngineError::Auth("password authentication failed".into()));
        }
        self.state.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
            cancel: Arc::new(FakeCancel { state: self.state.clone(), notify: Notify::new() }),
            closed: false,
        }))
    }
}

/// One scripted connection.
pub(crate) struct FakeConnection {
    state: Arc<FakeState>,
    cancel: Arc<FakeCancel>,
    closed: bool,
}

impl FakeConnection {
    async fn respond(&mut self, sql: &str, params: &[Value]) -> Result<Reply, EngineError> {
        self.state.statements.lock().push((sql.to_string(), params.to_vec()));
        let handler = self.state.handler.read().clone();
        match handler(sql, params) {
            Reply::Fail(err) => {
                if err.is_connection_lost() {
                    self.closed = true;
                }
                Err(err)
            }
            Reply::Hang => {
                self.cancel.notify.notified().await;
                Err(EngineError::Cancelled)
            }
            Reply::Stall => std::future::pending().await,
            reply => Ok(reply),
        }
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.state.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineConnection for FakeConnection {
    fn engine(&self) -> EngineType {
        self.state.engine
    }

    async fn query(&mut self, spec: QuerySpec<'_>) -> Result<RawResult, EngineError> {
        match self.respond(spec.sql, spec.params).await? {
            Reply::Rows { columns, rows } => {
                let mut remaining = rows.into_iter().skip(spec.skip);
                let collected: Vec<_> = remaining.by_ref().take(spec.max_rows).collect();
                let more_available = remaining.next().is_some();
                Ok(RawResult { columns, rows: collected, rows_affected: None, more_available })
            }
            Reply::Affected(n) => Ok(RawResult { rows_affected: Some(n), ..Default::default() }),
            _ => Ok(RawResult::default()),
        }
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, EngineError> {
        match self.respond(sql, params).await? {
            Reply::Affected(n) => Ok(n),
            Reply::Rows { rows, .. } => Ok(rows.len() as u64),
            _ => Ok(0),
        }
    }

    async fn ping(&mut self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::Unreachable("connection closed".into()))
        } else {
            Ok(())
        }
    }

    async fn server_version(&mut self) -> Result<String, EngineError> {
        Ok(match self.state.engine {
            EngineType::Postgres => "PostgreSQL 16.2 (fake)".to_string(),
            EngineType::Mysql => "8.0.36-fake".to_string(),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        self.cancel.clone()
    }
}

struct FakeCancel {
    state: Arc<FakeState>,
    notify: Notify,
}

#[async_trait]
impl CancelHandle for FakeCancel {
    async fn cancel(&self) -> Result<(), EngineError> {
        self.state.cancels.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }
}

/// Vault backed by the in-memory session store.
pub(crate) fn session_vault() -> Arc<CredentialVault> {
    Arc::new(CredentialVault::with_provider(Arc::new(SessionCredentialsProvider::new())))
}

/// A saved profile whose password is already in `vault`.
pub(crate) fn profile_in(vault: &CredentialVault, engine: EngineType) -> ConnectionProfile {
    let profile = ConnectionProfile::from_draft(ProfileDraft::new(
        "Fake",
        engine,
        "fake.local",
        "app",
        "tester",
    ));
    vault.store(profile.id, &Secret::new("secret")).expect("session vault store");
    profile
}

/// Configuration with short waits so tests finish fast.
pub(crate) fn fast_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.pool.max_size = 2;
    config.pool.wait_timeout_ms = 200;
    config.pool.connect_timeout_ms = 500;
    config.query.cancel_grace_ms = 200;
    config
}

/// Postgres-style catalog plus a `public.users(id pk, name)` table holding ids `1..=n`.
///
/// Keyset queries are answered by filtering on the first bound parameter.
pub(crate) fn users_table(n: i64) -> impl Fn(&str, &[Value]) -> Reply + Send + Sync + 'static {
    move |sql, params| {
        if sql.contains("pg_catalog.pg_attribute") {
            return Reply::Rows {
                columns: catalog_columns(),
                rows: vec![
                    column_row("id", "integer", false, true, true, 1),
                    column_row("name", "text", true, false, false, 2),
                ],
            };
        }
        if sql.contains("pg_catalog.pg_class") {
            return Reply::rows(
                &["schema", "name", "kind", "estimate"],
                vec![vec!["public".into(), "users".into(), "r".into(), Value::Integer(n)]],
            );
        }
        if sql.starts_with("SELECT COUNT(*)") {
            return Reply::rows(&["count"], vec![vec![Value::Integer(n)]]);
        }
        if sql.contains("FROM \"public\".\"users\"") {
            let after = params.first().and_then(Value::as_i64).unwrap_or(0);
            let rows = (1..=n)
                .filter(|id| *id > after)
                .map(|id| vec![Value::Integer(id), Value::Text(format!("user{id}"))])
                .collect();
            return Reply::Rows {
                columns: vec![
                    ColumnMetadata::new("id", "int4", true),
                    ColumnMetadata::new("name", "text", true),
                ],
                rows,
            };
        }
        Reply::Affected(1)
    }
}

fn catalog_columns() -> Vec<ColumnMetadata> {
    ["name", "data_type", "nullable", "default_value", "ordinal", "is_pk", "is_unique"]
        .iter()
        .map(|c| ColumnMetadata::new(*c, "text", true))
        .collect()
}

/// One row of the column catalog query.
pub(crate) fn column_row(
    name: &str,
    data_type: &str,
    nullable: bool,
    primary: bool,
    unique: bool,
    ordinal: i64,
) -> Vec<Value> {
    vec![
        name.into(),
        data_type.into(),
        Value::Boolean(nullable),
        Value::Null,
        Value::Integer(ordinal),
        Value::Boolean(primary),
        Value::Boolean(unique),
    ]
}

/// Column catalog reply for a table.
pub(crate) fn catalog_reply(rows: Vec<Vec<Value>>) -> Reply {
    Reply::Rows { columns: catalog_columns(), rows }
}
