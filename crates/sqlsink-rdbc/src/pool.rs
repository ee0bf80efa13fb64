//! Connection pool facade for sqlsink-rdbc
//!
//! Pick-one-and-run connection pooling with:
//! - Configurable pool sizes and timeouts
//! - Liveness checks of pooled connections
//! - Metrics and observability
//! - Idle connection management
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlsink_rdbc::prelude::*;
//! use sqlsink_rdbc::postgres::PgConnectionFactory;
//!
//! let pool = SimpleConnectionPool::new(
//!     PoolConfig::new("postgres://localhost/db").with_max_size(10),
//!     Arc::new(PgConnectionFactory),
//! ).await?;
//!
//! let affected = pick_one_and_run(&*pool, &Statement::new("INSERT ...")).await?;
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, ExecutionOptions,
};
use crate::error::{Error, ErrorCategory, Result};

/// Connection pool trait
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Get a connection from the pool
    async fn get(&self) -> Result<PooledConnection>;

    /// Return a connection to the pool
    async fn return_connection(&self, conn: Box<dyn Connection>, lease: Lease);

    /// Check pooled connections for liveness, one flag per sampled connection.
    ///
    /// Only connections nobody has borrowed are sampled, each under a pool
    /// slot, so a health check never grows the pool past its maximum or waits behind
    /// query traffic.
    async fn health_check_all(&self) -> Vec<bool>;

    /// Backend the pool's connections talk to
    fn database_type(&self) -> DatabaseType;

    /// Get current pool size
    fn size(&self) -> usize;

    /// Get number of idle connections
    fn idle(&self) -> usize;

    /// Get number of connections in use
    fn in_use(&self) -> usize {
        self.size().saturating_sub(self.idle())
    }

    /// Get pool statistics
    fn stats(&self) -> PoolStats;

    /// Close all connections and shutdown the pool
    async fn close(&self) -> Result<()>;
}

/// A unit of work run against exactly one pooled connection
#[async_trait]
pub trait PoolJob: Send + Sync {
    /// Value produced on success
    type Output: Send;

    /// Run the job on the picked connection
    async fn run(&self, conn: &dyn Connection) -> Result<Self::Output>;
}

/// A single statement run under fixed execution options
#[derive(Debug, Clone)]
pub struct Statement<'a> {
    /// SQL text
    pub sql: &'a str,
    /// Execution options
    pub options: &'a ExecutionOptions,
}

static DEFAULT_OPTIONS: ExecutionOptions = ExecutionOptions { database: None };

impl<'a> Statement<'a> {
    /// Statement with default execution options
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql,
            options: &DEFAULT_OPTIONS,
        }
    }

    /// Statement with explicit execution options
    pub fn with_options(sql: &'a str, options: &'a ExecutionOptions) -> Self {
        Self { sql, options }
    }
}

#[async_trait]
impl PoolJob for Statement<'_> {
    type Output = u64;

    async fn run(&self, conn: &dyn Connection) -> Result<u64> {
        conn.run(self.sql, self.options).await
    }
}

/// Failure of a pick-one-and-run call
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection could be handed out (exhausted, shut down or unreachable)
    #[error("no connection available: {0}")]
    Empty(#[source] Error),

    /// The job itself failed on the picked connection
    #[error(transparent)]
    Driver(Error),
}

impl PoolError {
    /// The underlying driver error
    pub fn inner(&self) -> &Error {
        match self {
            Self::Empty(e) | Self::Driver(e) => e,
        }
    }
}

/// Acquire one connection, run `job` on it and hand the connection back.
///
/// Acquisition failures (timeout, shutdown, refused connects) surface as
/// [`PoolError::Empty`]; anything the job reports surfaces as
/// [`PoolError::Driver`].
pub async fn pick_one_and_run<J>(
    pool: &dyn ConnectionPool,
    job: &J,
) -> std::result::Result<J::Output, PoolError>
where
    J: PoolJob + ?Sized,
{
    let mut conn = pool.get().await.map_err(|e| match e.category() {
        ErrorCategory::PoolExhausted | ErrorCategory::Connection | ErrorCategory::Timeout => {
            PoolError::Empty(e)
        }
        _ => PoolError::Driver(e),
    })?;

    let result = job.run(&*conn).await;
    result.map_err(|e| {
        if e.category() == ErrorCategory::Connection {
            conn.mark_broken();
        }
        PoolError::Driver(e)
    })
}

/// Bookkeeping a borrowed connection carries back to its pool
#[derive(Debug, Clone, Copy)]
pub struct Lease {
    /// When the underlying connection was opened
    pub created_at: Instant,
    /// Set once the connection failed at the connection level
    pub broken: bool,
}

/// A connection borrowed from the pool
pub struct PooledConnection {
    /// The underlying connection
    conn: Option<Box<dyn Connection>>,
    /// Age and health handed back on return
    lease: Lease,
    /// Reference to the pool for return
    pool: Arc<dyn ConnectionPool>,
}

impl PooledConnection {
    /// Create a new pooled connection wrapper
    pub fn new(conn: Box<dyn Connection>, lease: Lease, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            conn: Some(conn),
            lease,
            pool,
        }
    }

    /// When the underlying connection was opened
    pub fn created_at(&self) -> Instant {
        self.lease.created_at
    }

    /// Have the pool discard the connection instead of reusing it
    pub fn mark_broken(&mut self) {
        self.lease.broken = true;
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection already returned")
            .as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            let lease = self.lease;
            tokio::spawn(async move {
                pool.return_connection(conn, lease).await;
            });
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Minimum pool size (idle connections)
    pub min_size: usize,
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Duration,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Duration,
    /// Health check interval
    pub health_check_interval: Duration,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
    /// Whether to test connections on return
    pub test_on_return: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            min_size: 1,
            max_size: 8,
            acquire_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(1800), // 30 minutes
            idle_timeout: Duration::from_secs(600),  // 10 minutes
            health_check_interval: Duration::from_secs(15),
            test_on_borrow: true,
            test_on_return: false,
        }
    }
}

impl PoolConfig {
    /// Create pool config from a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set health check interval
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    /// Enable/disable test on return
    pub fn with_test_on_return(mut self, test: bool) -> Self {
        self.test_on_return = test;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Number of times pool was exhausted
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of health check failures
    pub health_check_failures: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }

    /// Calculate average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
        }
    }
}

/// A semaphore-bounded connection pool.
///
/// - `max_size` permits bound the number of borrowed connections
/// - idle connections are reused LIFO and recycled past their lifetime
/// - `min_size` connections are opened eagerly; failures there are logged
///   and left to lazy creation
pub struct SimpleConnectionPool {
    /// Pool configuration
    config: PoolConfig,
    /// Connection factory
    factory: Arc<dyn ConnectionFactory>,
    /// Idle connections (LIFO for better cache locality)
    idle: Mutex<Vec<PoolEntry>>,
    /// Semaphore to limit total connections
    semaphore: Semaphore,
    /// Current total connection count
    total_connections: AtomicUsize,
    /// Current idle connection count
    idle_connections: AtomicUsize,
    /// Statistics
    stats: Arc<AtomicPoolStats>,
    /// Shutdown flag
    shutdown: std::sync::atomic::AtomicBool,
    /// Outcome of the last health check that sampled anything
    last_sample: parking_lot::Mutex<Vec<bool>>,
    /// Self reference for creating PooledConnections
    self_ref: tokio::sync::OnceCell<std::sync::Weak<Self>>,
}

/// Internal pool entry with metadata
struct PoolEntry {
    /// The connection
    conn: Box<dyn Connection>,
    /// When the connection was created
    created_at: Instant,
    /// When last used
    last_used: Instant,
}

impl PoolEntry {
    fn fresh(conn: Box<dyn Connection>) -> Self {
        Self::returned(conn, Instant::now())
    }

    fn returned(conn: Box<dyn Connection>, created_at: Instant) -> Self {
        Self {
            conn,
            created_at,
            last_used: Instant::now(),
        }
    }
}

impl SimpleConnectionPool {
    /// Create a new connection pool.
    ///
    /// Initializes with `min_size` connections eagerly.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        if config.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }

        let pool = Arc::new(Self {
            semaphore: Semaphore::new(config.max_size),
            config: config.clone(),
            factory,
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            total_connections: AtomicUsize::new(0),
            idle_connections: AtomicUsize::new(0),
            stats: Arc::new(AtomicPoolStats::new()),
            shutdown: std::sync::atomic::AtomicBool::new(false),
            last_sample: parking_lot::Mutex::new(Vec::new()),
            self_ref: tokio::sync::OnceCell::new(),
        });

        let _ = pool.self_ref.set(Arc::downgrade(&pool));

        for _ in 0..config.min_size.min(config.max_size) {
            match pool.create_connection().await {
                Ok(conn) => pool.push_idle(PoolEntry::fresh(conn)).await,
                Err(e) => {
                    warn!(
                        url = %config.connection.redacted_url(),
                        error = %e,
                        "Failed to pre-open pooled connection"
                    );
                    break;
                }
            }
        }

        Ok(pool)
    }

    fn get_self_arc(&self) -> Option<Arc<Self>> {
        self.self_ref.get().and_then(|w| w.upgrade())
    }

    /// Create a new connection using the factory
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let conn = self.factory.connect(&self.config.connection).await?;
        self.total_connections.fetch_add(1, Ordering::Release);
        self.stats.record_created();
        Ok(conn)
    }

    async fn push_idle(&self, entry: PoolEntry) {
        let mut idle = self.idle.lock().await;
        idle.push(entry);
        self.idle_connections.store(idle.len(), Ordering::Release);
    }

    async fn discard(&self, conn: Box<dyn Connection>) {
        let _ = conn.close().await;
        self.total_connections.fetch_sub(1, Ordering::Release);
        self.stats.record_closed();
    }

    /// Validate a connection before returning it
    async fn validate_connection(&self, conn: &dyn Connection) -> bool {
        if self.config.test_on_borrow {
            conn.is_valid().await
        } else {
            true
        }
    }

    /// Check if a connection should be recycled (expired)
    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }

    /// Health check when no idle connection could be sampled.
    ///
    /// With a free slot a fresh connection is opened, checked and kept.
    /// Without one every connection is borrowed and was validated when it
    /// was handed out, so the previous sample stands instead of queueing
    /// behind query traffic.
    async fn check_free_slot(&self) -> Vec<bool> {
        let Ok(_permit) = self.semaphore.try_acquire() else {
            let last = self.last_sample.lock().clone();
            debug!(
                in_use = self.in_use(),
                "Every connection is borrowed, reusing last health sample"
            );
            return if last.is_empty() { vec![true] } else { last };
        };

        let results = match self.create_connection().await {
            Ok(conn) => {
                let alive = conn.is_valid().await;
                if alive {
                    self.push_idle(PoolEntry::fresh(conn)).await;
                } else {
                    self.stats.record_health_check_failure();
                    self.discard(conn).await;
                }
                vec![alive]
            }
            Err(e) => {
                debug!(error = %e, "Health check could not open a connection");
                vec![false]
            }
        };

        *self.last_sample.lock() = results.clone();
        results
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionPool for SimpleConnectionPool {
    async fn get(&self) -> Result<PooledConnection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::pool_exhausted("Pool is shut down"));
        }

        let start = Instant::now();

        let permit = tokio::time::timeout(self.config.acquire_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| {
                self.stats.record_exhausted();
                Error::pool_exhausted(format!(
                    "Timeout waiting for connection ({}ms)",
                    self.config.acquire_timeout.as_millis()
                ))
            })?
            .map_err(|_| Error::pool_exhausted("Pool semaphore closed"))?;

        let conn = loop {
            let entry = {
                let mut idle = self.idle.lock().await;
                let entry = idle.pop();
                self.idle_connections.store(idle.len(), Ordering::Release);
                entry
            };
            match entry {
                Some(entry) => {
                    if self.should_recycle(&entry) {
                        debug!("Recycling expired pooled connection");
                        self.discard(entry.conn).await;
                        continue;
                    }
                    if !self.validate_connection(&*entry.conn).await {
                        self.stats.record_health_check_failure();
                        self.discard(entry.conn).await;
                        continue;
                    }
                    break Some((entry.conn, entry.created_at));
                }
                None => break None,
            }
        };

        let (conn, created_at) = match conn {
            Some(reused) => reused,
            None => match self.create_connection().await {
                Ok(c) => (c, Instant::now()),
                Err(e) => {
                    drop(permit);
                    return Err(e);
                }
            },
        };

        let wait_ms = start.elapsed().as_millis() as u64;
        self.stats.record_acquisition(wait_ms);

        // Released again in return_connection
        permit.forget();

        let pool_arc = self
            .get_self_arc()
            .ok_or_else(|| Error::pool_exhausted("Pool has been dropped"))?;

        let lease = Lease {
            created_at,
            broken: false,
        };
        Ok(PooledConnection::new(conn, lease, pool_arc))
    }

    async fn return_connection(&self, conn: Box<dyn Connection>, lease: Lease) {
        self.semaphore.add_permits(1);

        if self.shutdown.load(Ordering::Acquire) {
            self.discard(conn).await;
            return;
        }

        if lease.broken || conn.is_closed() {
            debug!("Discarding connection that failed at the connection level");
            self.discard(conn).await;
            return;
        }

        if self.config.test_on_return && !conn.is_valid().await {
            self.stats.record_health_check_failure();
            self.discard(conn).await;
            return;
        }

        self.push_idle(PoolEntry::returned(conn, lease.created_at)).await;
    }

    async fn health_check_all(&self) -> Vec<bool> {
        if self.shutdown.load(Ordering::Acquire) {
            return Vec::new();
        }

        // Every sampled connection is taken out under its own permit, so
        // concurrent borrowers see a busy slot instead of opening a new one.
        let (sampled, permits) = {
            let mut idle = self.idle.lock().await;
            let mut permits = Vec::with_capacity(idle.len());
            while permits.len() < idle.len() {
                match self.semaphore.try_acquire() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }
            let at = idle.len() - permits.len();
            let sampled = idle.split_off(at);
            self.idle_connections.store(idle.len(), Ordering::Release);
            (sampled, permits)
        };

        if sampled.is_empty() {
            drop(permits);
            return self.check_free_slot().await;
        }

        let mut results = Vec::with_capacity(sampled.len());
        for entry in sampled {
            let alive = entry.conn.is_valid().await;
            results.push(alive);
            if alive {
                self.push_idle(entry).await;
            } else {
                self.stats.record_health_check_failure();
                self.discard(entry.conn).await;
            }
        }
        drop(permits);

        *self.last_sample.lock() = results.clone();
        results
    }

    fn database_type(&self) -> DatabaseType {
        self.factory.database_type()
    }

    fn size(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }

    fn idle(&self) -> usize {
        self.idle_connections.load(Ordering::Acquire)
    }

    fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);

        let drained: Vec<PoolEntry> = {
            let mut idle = self.idle.lock().await;
            self.idle_connections.store(0, Ordering::Release);
            idle.drain(..).collect()
        };
        for entry in drained {
            self.discard(entry.conn).await;
        }

        Ok(())
    }
}
