//! Per-profile connection pooling with deadpool.
//!
//! Provides connection management with:
//! - Lazy, idempotent pool materialization per profile
//! - Connection validation and pre-warming on pool creation
//! - Bounded wait on pool exhaustion
//! - One transparent retry when a fresh connection cannot be opened
//! - Background reaping of idle connections down to `min_size`

use crate::config::{PoolConfig, RecyclingMethod};
use crate::engine::{ConnectTarget, Connector, EngineConnection, EngineError, QuerySpec, RawResult};
use crate::error::{ConnectionError, QueryError};
use crate::models::{
    ConnectionProfile, EngineType, PoolStatus, ProfileDraft, Secret, TestConnectionResult,
};
use crate::services::credentials::CredentialVault;

use chrono::{DateTime, Utc};
use deadpool::managed::{
    self, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult, TimeoutType,
};
use deadpool::Runtime;
use parking_lot::{Mutex, RwLock};
use std::cell::Cell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Monotonic pool generation, bumped every time any pool is created.
static POOL_GENERATION: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// EngineManager
// ============================================================================

/// deadpool manager opening connections through an engine [`Connector`].
pub struct EngineManager {
    connector: Arc<dyn Connector>,
    target: ConnectTarget,
    recycling: RecyclingMethod,
}

impl managed::Manager for EngineManager {
    type Type = Box<dyn EngineConnection>;
    type Error = EngineError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let conn = self.connector.connect(&self.target).await?;
        tracing::debug!(
            engine = %self.target.engine,
            host = %self.target.host,
            "Physical connection opened"
        );
        Ok(conn)
    }

    async fn recycle(&self, conn: &mut Self::Type, _: &Metrics) -> RecycleResult<Self::Error> {
        if conn.is_closed() {
            return Err(RecycleError::Backend(EngineError::Unreachable(
                "connection closed by server".into(),
            )));
        }
        if self.recycling == RecyclingMethod::Verified {
            conn.ping().await.map_err(RecycleError::Backend)?;
        }
        Ok(())
    }
}

fn connect_target(draft: &ProfileDraft, password: Secret, connect_timeout: Duration) -> ConnectTarget {
    ConnectTarget {
        engine: draft.engine,
        host: draft.host.clone(),
        port: draft.port,
        database: draft.database.clone(),
        username: draft.username.clone(),
        password,
        connect_timeout,
    }
}

// ============================================================================
// ProfilePool
// ============================================================================

/// A managed pool of connections for one connection profile.
pub struct ProfilePool {
    profile_id: Uuid,
    engine: EngineType,
    pool: Pool<EngineManager>,
    generation: u64,
    connect_timeout: Duration,
    reaper: CancellationToken,
    created_at: DateTime<Utc>,
}

impl ProfilePool {
    /// Build the pool and open `min_size` validated connections.
    ///
    /// Nothing is kept when the first connection fails.
    async fn open(
        profile_id: Uuid,
        target: ConnectTarget,
        connector: Arc<dyn Connector>,
        config: &PoolConfig,
    ) -> Result<Self, ConnectionError> {
        let engine = target.engine;
        let connect_timeout = target.connect_timeout;
        let manager = EngineManager { connector, target, recycling: config.recycling };

        let pool = Pool::builder(manager)
            .max_size(config.max_size)
            .wait_timeout(Some(config.wait_timeout()))
            .create_timeout(Some(connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| ConnectionError::Unreachable(format!("Failed to create pool: {e}")))?;

        let this = Self {
            profile_id,
            engine,
            pool,
            generation: POOL_GENERATION.fetch_add(1, Ordering::SeqCst),
            connect_timeout,
            reaper: CancellationToken::new(),
            created_at: Utc::now(),
        };

        let mut warm = Vec::with_capacity(config.min_size);
        for _ in 0..config.min_size {
            match this.get().await {
                Ok(conn) => warm.push(conn),
                Err(err) => {
                    this.close();
                    return Err(err);
                }
            }
        }
        drop(warm);

        this.spawn_reaper(config);
        Ok(this)
    }

    /// Profile this pool serves.
    pub fn profile_id(&self) -> Uuid {
        self.profile_id
    }

    /// Engine of every connection in the pool.
    pub fn engine(&self) -> EngineType {
        self.engine
    }

    /// Identifies this materialization; a reconnect yields a larger value.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Get when this pool was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Acquire a connection.
    ///
    /// Waits up to the configured bound on an exhausted pool. A failure to
    /// open a fresh connection is retried once; authentication failures and
    /// exhaustion are not.
    pub async fn get(&self) -> Result<PooledConnection, ConnectionError> {
        match self.get_once().await {
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    connection_id = %self.profile_id,
                    error = %err,
                    "Connection attempt failed, retrying once"
                );
                self.get_once().await
            }
            other => other,
        }
    }

    async fn get_once(&self) -> Result<PooledConnection, ConnectionError> {
        match self.pool.get().await {
            Ok(conn) => Ok(PooledConnection { conn, profile_id: self.profile_id }),
            Err(err) => Err(self.map_pool_error(err)),
        }
    }

    /// Run one statement that is safe to repeat.
    ///
    /// When the connection is lost mid-statement it is evicted and the
    /// statement is retried once on a fresh connection.
    pub async fn query(&self, spec: QuerySpec<'_>) -> Result<RawResult, QueryError> {
        let mut retried = false;
        loop {
            let mut conn = self.get().await?;
            match conn.query(spec).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_connection_lost() => {
                    conn.evict();
                    if retried {
                        return Err(err.into());
                    }
                    retried = true;
                    tracing::warn!(connection_id = %self.profile_id, error = %err, "Connection lost, retrying statement once");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn map_pool_error(&self, err: PoolError<EngineError>) -> ConnectionError {
        match err {
            PoolError::Timeout(TimeoutType::Wait) => {
                let status = self.pool.status();
                tracing::warn!(
                    connection_id = %self.profile_id,
                    max_size = status.max_size,
                    waiting = status.waiting,
                    "Connection pool exhausted"
                );
                ConnectionError::Exhausted { max_size: status.max_size, waiting: status.waiting }
            }
            PoolError::Timeout(TimeoutType::Create) => ConnectionError::Timeout(format!(
                "no connection established within {}ms",
                self.connect_timeout.as_millis()
            )),
            PoolError::Timeout(TimeoutType::Recycle) => {
                ConnectionError::Unreachable("health check timed out".into())
            }
            PoolError::Backend(err) => err.into(),
            PoolError::Closed => ConnectionError::Unreachable("connection pool closed".into()),
            other => ConnectionError::Unreachable(other.to_string()),
        }
    }

    /// Get current pool status.
    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available as isize,
            waiting: status.waiting,
            borrowed: status.size.saturating_sub(status.available),
        }
    }

    /// Close the pool, dropping idle connections. Borrowed ones close on return.
    pub fn close(&self) {
        self.reaper.cancel();
        self.pool.close();
        tracing::info!(connection_id = %self.profile_id, "Connection pool closed");
    }

    /// Check if the pool is closed.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn spawn_reaper(&self, config: &PoolConfig) {
        let pool = self.pool.clone();
        let token = self.reaper.clone();
        let profile_id = self.profile_id;
        let idle_timeout = config.idle_timeout();
        let min_size = config.min_size;
        let mut ticker = tokio::time::interval(config.reap_interval());

        tokio::spawn(async move {
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = reap_idle(&pool, idle_timeout, min_size);
                        if removed > 0 {
                            tracing::debug!(connection_id = %profile_id, removed, "Reaped idle connections");
                        }
                    }
                }
            }
        });
    }
}

impl Drop for ProfilePool {
    fn drop(&mut self) {
        self.reaper.cancel();
    }
}

/// Remove connections idle longer than `idle_timeout` while keeping `min_size` open.
fn reap_idle(pool: &Pool<EngineManager>, idle_timeout: Duration, min_size: usize) -> usize {
    let budget = Cell::new(pool.status().size.saturating_sub(min_size));
    let result = pool.retain(|_, metrics| {
        if budget.get() > 0 && metrics.last_used() > idle_timeout {
            budget.set(budget.get() - 1);
            false
        } else {
            true
        }
    });
    result.removed.len()
}

/// A connection acquired from a [`ProfilePool`].
///
/// Automatically returns to the pool when dropped; [`evict`](Self::evict)
/// discards it instead.
pub struct PooledConnection {
    conn: Object<EngineManager>,
    profile_id: Uuid,
}

impl PooledConnection {
    /// Get the profile this connection belongs to.
    pub fn profile_id(&self) -> Uuid {
        self.profile_id
    }

    /// Close the physical connection and free its pool slot.
    pub fn evict(self) {
        tracing::debug!(connection_id = %self.profile_id, "Evicting pooled connection");
        drop(Object::take(self.conn));
    }
}

impl Deref for PooledConnection {
    type Target = dyn EngineConnection;

    fn deref(&self) -> &Self::Target {
        &**self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.conn
    }
}

// ============================================================================
// PoolManager
// ============================================================================

/// Owns one pool per connected profile.
pub struct PoolManager {
    pools: RwLock<HashMap<Uuid, Arc<ProfilePool>>>,
    init_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    connector: Arc<dyn Connector>,
    vault: Arc<CredentialVault>,
    config: PoolConfig,
}

impl PoolManager {
    /// Create a manager with no pools.
    pub fn new(connector: Arc<dyn Connector>, vault: Arc<CredentialVault>, config: PoolConfig) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            init_locks: Mutex::new(HashMap::new()),
            connector,
            vault,
            config,
        }
    }

    /// Pool settings in effect.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Return the profile's pool, materializing it on first use.
    pub async fn acquire_pool(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Arc<ProfilePool>, ConnectionError> {
        self.acquire(profile).await.map(|(pool, _)| pool)
    }

    /// Like [`acquire_pool`](Self::acquire_pool), also reporting whether the
    /// pool was created by this call.
    pub(crate) async fn acquire(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<(Arc<ProfilePool>, bool), ConnectionError> {
        if let Some(pool) = self.pool(profile.id) {
            return Ok((pool, false));
        }

        let init = self.init_lock(profile.id);
        let outcome = {
            let _guard = init.lock().await;
            match self.pool(profile.id) {
                Some(pool) => Ok((pool, false)),
                None => self.open_pool(profile).await.map(|pool| (pool, true)),
            }
        };
        self.release_init_lock(profile.id, &init);
        outcome
    }

    async fn open_pool(&self, profile: &ConnectionProfile) -> Result<Arc<ProfilePool>, ConnectionError> {
        let password = self.vault.retrieve(profile.id)?;
        let target = connect_target(&profile.draft(), password, self.config.connect_timeout());
        let pool = Arc::new(
            ProfilePool::open(profile.id, target, self.connector.clone(), &self.config).await?,
        );

        self.pools.write().insert(profile.id, pool.clone());
        tracing::info!(
            connection_id = %profile.id,
            engine = %profile.engine,
            host = %profile.address(),
            database = %profile.database,
            "Connection pool created"
        );
        Ok(pool)
    }

    fn init_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.init_locks.lock().entry(id).or_default().clone()
    }

    /// Forget the profile's init lock unless another caller is waiting on it.
    fn release_init_lock(&self, id: Uuid, init: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.init_locks.lock();
        // One reference in the map, one held by the caller.
        if locks.get(&id).is_some_and(|lock| Arc::ptr_eq(lock, init) && Arc::strong_count(lock) == 2) {
            locks.remove(&id);
        }
    }

    /// The profile's pool, if materialized and open.
    pub fn pool(&self, id: Uuid) -> Option<Arc<ProfilePool>> {
        self.pools.read().get(&id).filter(|pool| !pool.is_closed()).cloned()
    }

    /// Open one connection with the given settings, ask for the server
    /// version, and close it. No pool or registry state is touched.
    pub async fn test_connection(&self, draft: &ProfileDraft, password: &Secret) -> TestConnectionResult {
        let started = Instant::now();
        if let Err(err) = draft.validate() {
            return TestConnectionResult::failed(err.kind(), err.to_string(), 0);
        }

        let timeout = self.config.connect_timeout();
        let target = connect_target(draft, password.clone(), timeout);
        let outcome = match tokio::time::timeout(timeout, self.connector.connect(&target)).await {
            Err(_) => Err(ConnectionError::Timeout(format!(
                "no connection established within {}ms",
                timeout.as_millis()
            ))),
            Ok(Err(err)) => Err(ConnectionError::from(err)),
            Ok(Ok(mut conn)) => conn.server_version().await.map_err(ConnectionError::from),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(version) => {
                tracing::info!(host = %draft.host, engine = %draft.engine, latency_ms, "Connection test succeeded");
                TestConnectionResult::ok(version, latency_ms)
            }
            Err(err) => {
                tracing::info!(host = %draft.host, engine = %draft.engine, error = %err, "Connection test failed");
                TestConnectionResult::failed(err.kind(), err.to_string(), latency_ms)
            }
        }
    }

    /// Close and forget the profile's pool. Returns whether one existed.
    pub fn close_pool(&self, id: Uuid) -> bool {
        let removed = self.pools.write().remove(&id);
        self.init_locks.lock().remove(&id);
        match removed {
            Some(pool) => {
                pool.close();
                true
            }
            None => false,
        }
    }

    /// Close every pool.
    pub fn close_all(&self) {
        let pools: Vec<_> = self.pools.write().drain().collect();
        for (_, pool) in pools {
            pool.close();
        }
    }

    /// Check whether the profile has an open pool.
    pub fn is_connected(&self, id: Uuid) -> bool {
        self.pool(id).is_some()
    }

    /// Status of the profile's pool.
    pub fn status(&self, id: Uuid) -> Option<PoolStatus> {
        self.pool(id).map(|pool| pool.status())
    }

    /// Status of every open pool.
    pub fn statuses(&self) -> HashMap<Uuid, PoolStatus> {
        self.pools
            .read()
            .iter()
            .filter(|(_, pool)| !pool.is_closed())
            .map(|(id, pool)| (*id, pool.status()))
            .collect()
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        for pool in self.pools.get_mut().values() {
            pool.close();
        }
    }
}
