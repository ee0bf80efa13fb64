//! In-memory connection backend for tests
//!
//! Records every statement it is asked to run instead of talking to a
//! server, and can be told to fail or refuse connections so pool and
//! executor error paths can be exercised without external dependencies.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlsink_rdbc::testing::*;
//!
//! let backend = MemoryBackend::new();
//! let factory = Arc::new(MemoryConnectionFactory::new(backend.clone()));
//! let pool = SimpleConnectionPool::new(PoolConfig::new("memory://"), factory).await?;
//!
//! pick_one_and_run(&*pool, &Statement::new("INSERT INTO t VALUES (1)")).await?;
//! assert_eq!(backend.statements().len(), 1);
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// A statement the memory backend was asked to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStatement {
    /// Rendered SQL text
    pub sql: String,
    /// Database the session was switched to, if any
    pub database: Option<String>,
}

#[derive(Debug)]
struct BackendState {
    statements: Mutex<Vec<ExecutedStatement>>,
    healthy: AtomicBool,
    refuse_connections: AtomicBool,
    fail_with: Mutex<Option<String>>,
    latency: Mutex<Option<Duration>>,
    connections_opened: AtomicUsize,
    /// Connections opened before the current generation are dead
    generation: AtomicUsize,
}

/// Shared state behind every [`MemoryConnection`] of one factory
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<BackendState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a healthy backend with an empty statement log
    pub fn new() -> Self {
        Self {
            state: Arc::new(BackendState {
                statements: Mutex::new(Vec::new()),
                healthy: AtomicBool::new(true),
                refuse_connections: AtomicBool::new(false),
                fail_with: Mutex::new(None),
                latency: Mutex::new(None),
                connections_opened: AtomicUsize::new(0),
                generation: AtomicUsize::new(0),
            }),
        }
    }

    /// Mark the backend as reachable or not; unhealthy backends fail every statement
    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Refuse (or accept again) new connections
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Fail every executed statement with the given message
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.state.fail_with.lock() = Some(message.into());
    }

    /// Stop failing statements
    pub fn clear_failure(&self) {
        *self.state.fail_with.lock() = None;
    }

    /// Delay every statement by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = Some(latency);
    }

    /// All statements executed so far, in order
    pub fn statements(&self) -> Vec<ExecutedStatement> {
        self.state.statements.lock().clone()
    }

    /// SQL text of every statement executed so far
    pub fn executed_sql(&self) -> Vec<String> {
        self.state
            .statements
            .lock()
            .iter()
            .map(|s| s.sql.clone())
            .collect()
    }

    /// Forget the statement log
    pub fn clear(&self) {
        self.state.statements.lock().clear();
    }

    /// Number of connections opened through the factory
    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    /// Sever every connection opened so far, as a server restart would.
    ///
    /// Connections opened afterwards work normally.
    pub fn drop_connections(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn generation(&self) -> usize {
        self.state.generation.load(Ordering::SeqCst)
    }

    fn is_healthy(&self) -> bool {
        self.state.healthy.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = *self.state.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// A connection handed out by [`MemoryConnectionFactory`]
#[derive(Debug)]
pub struct MemoryConnection {
    backend: MemoryBackend,
    database: Mutex<Option<String>>,
    closed: AtomicBool,
    generation: usize,
}

impl MemoryConnection {
    /// Create a connection bound to `backend`
    pub fn new(backend: MemoryBackend) -> Self {
        let generation = backend.generation();
        Self {
            backend,
            database: Mutex::new(None),
            closed: AtomicBool::new(false),
            generation,
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        if !self.backend.is_healthy() {
            return Err(Error::connection("memory backend unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&self, _sql: &str) -> Result<Vec<Row>> {
        self.ensure_usable()?;
        self.backend.simulate_latency().await;
        Ok(vec![Row::new(vec!["?column?".into()], vec![Value::Int64(1)])])
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.ensure_usable()?;
        self.backend.simulate_latency().await;

        let failure = self.backend.state.fail_with.lock().clone();
        if let Some(message) = failure {
            return Err(Error::query_with_sql(message, sql));
        }

        let database = self.database.lock().clone();
        self.backend
            .state
            .statements
            .lock()
            .push(ExecutedStatement {
                sql: sql.to_string(),
                database,
            });
        Ok(1)
    }

    async fn use_database(&self, database: Option<&str>) -> Result<()> {
        self.ensure_usable()?;
        *self.database.lock() = database.map(str::to_string);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.generation < self.backend.generation()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory producing [`MemoryConnection`]s over one shared backend
#[derive(Debug, Clone)]
pub struct MemoryConnectionFactory {
    backend: MemoryBackend,
    database_type: DatabaseType,
}

impl Default for MemoryConnectionFactory {
    fn default() -> Self {
        Self::new(MemoryBackend::new())
    }
}

impl MemoryConnectionFactory {
    /// Create a factory over `backend`
    pub fn new(backend: MemoryBackend) -> Self {
        Self {
            backend,
            database_type: DatabaseType::Memory,
        }
    }

    /// Report another backend type, to exercise dialect-dependent paths
    pub fn with_database_type(mut self, database_type: DatabaseType) -> Self {
        self.database_type = database_type;
        self
    }

    /// The shared backend
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        if self.backend.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(Error::connection("memory backend refused connection"));
        }
        self.backend
            .state
            .connections_opened
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection::new(self.backend.clone())))
    }

    fn database_type(&self) -> DatabaseType {
        self.database_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ExecutionOptions;

    #[tokio::test]
    async fn test_memory_connection_records_statements() {
        let backend = MemoryBackend::new();
        let conn = MemoryConnection::new(backend.clone());

        let options = ExecutionOptions::with_database("metrics");
        assert_eq!(conn.run("INSERT INTO t VALUES (1)", &options).await.unwrap(), 1);

        assert_eq!(
            backend.statements(),
            vec![ExecutedStatement {
                sql: "INSERT INTO t VALUES (1)".into(),
                database: Some("metrics".into()),
            }]
        );
    }

    #[tokio::test]
    async fn test_memory_connection_failure_modes() {
        let backend = MemoryBackend::new();
        let conn = MemoryConnection::new(backend.clone());

        backend.fail_with("syntax error at or near VALUE");
        let err = conn.execute("INSERT INTO t VALUE (1)").await.unwrap_err();
        assert_eq!(err.sql(), Some("INSERT INTO t VALUE (1)"));
        assert!(conn.is_valid().await);

        backend.set_healthy(false);
        assert!(!conn.is_valid().await);
        assert!(conn.execute("SELECT 1").await.unwrap_err().is_retriable());
        assert!(backend.statements().is_empty());
    }

    #[tokio::test]
    async fn test_unset_database_resets_session() {
        let backend = MemoryBackend::new();
        let conn = MemoryConnection::new(backend.clone());

        conn.run("INSERT INTO a VALUES (1)", &ExecutionOptions::with_database("tenant_a"))
            .await
            .unwrap();
        conn.run("INSERT INTO b VALUES (1)", &ExecutionOptions::default())
            .await
            .unwrap();

        let databases: Vec<_> = backend.statements().into_iter().map(|s| s.database).collect();
        assert_eq!(databases, vec![Some("tenant_a".to_string()), None]);
    }

    #[tokio::test]
    async fn test_dropped_connections_stay_dead() {
        let backend = MemoryBackend::new();
        let old = MemoryConnection::new(backend.clone());

        backend.drop_connections();
        assert!(old.is_closed());
        assert!(!old.is_valid().await);
        assert_eq!(
            old.execute("INSERT INTO t VALUES (1)").await.unwrap_err().category(),
            crate::ErrorCategory::Connection
        );

        let fresh = MemoryConnection::new(backend.clone());
        assert!(!fresh.is_closed());
        assert!(fresh.is_valid().await);
    }

    #[tokio::test]
    async fn test_factory_refuses_connections() {
        let backend = MemoryBackend::new();
        let factory = MemoryConnectionFactory::new(backend.clone());

        assert!(factory.connect(&ConnectionConfig::default()).await.is_ok());
        backend.set_refuse_connections(true);
        assert!(factory.connect(&ConnectionConfig::default()).await.is_err());
        assert_eq!(backend.connections_opened(), 1);
        assert_eq!(factory.database_type(), DatabaseType::Memory);
    }
}
