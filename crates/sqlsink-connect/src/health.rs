//! Connection health checking
//!
//! Liveness is checked per pooled connection with a trivial read-only
//! statement; the per-connection flags reduce to a two-state status. There is
//! no terminal failure state: a pool that stays unreachable keeps reporting
//! [`ConnectedState::Connecting`] until its supervisor intervenes.

use serde::Serialize;
use sqlsink_rdbc::connection::Connection;
use sqlsink_rdbc::pool::ConnectionPool;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Aggregate pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectedState {
    /// Every sampled connection answered the liveness check
    Connected,
    /// At least one liveness check failed, or nothing could be sampled
    Connecting,
}

impl ConnectedState {
    /// Whether the pool is usable
    #[inline]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Connecting => write!(f, "connecting"),
        }
    }
}

/// Check one connection with the liveness statement
pub async fn check(conn: &dyn Connection) -> bool {
    conn.is_valid().await
}

/// `Connected` iff at least one connection was sampled and all are alive
pub fn aggregate(results: &[bool]) -> ConnectedState {
    if !results.is_empty() && results.iter().all(|alive| *alive) {
        ConnectedState::Connected
    } else {
        ConnectedState::Connecting
    }
}

/// Check the pool using its own fan-out and reduce the result
pub async fn pool_status(pool: &dyn ConnectionPool) -> ConnectedState {
    let results = pool.health_check_all().await;
    let state = aggregate(&results);
    debug!(
        sampled = results.len(),
        alive = results.iter().filter(|alive| **alive).count(),
        %state,
        "Pool health checked"
    );
    state
}

/// Background task re-checking a pool on a fixed interval.
///
/// The latest status is published on a watch channel; the task stops when
/// the monitor is dropped or [`HealthMonitor::stop`] is called.
#[derive(Debug)]
pub struct HealthMonitor {
    state: watch::Receiver<ConnectedState>,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Spawn a monitor; the first check runs immediately
    pub fn spawn(pool: Arc<dyn ConnectionPool>, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(ConnectedState::Connecting);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let state = pool_status(pool.as_ref()).await;
                let previous = *tx.borrow();
                if previous != state {
                    if state.is_connected() {
                        info!(%state, "Connector health changed");
                    } else {
                        warn!(%state, "Connector health changed");
                    }
                }
                if tx.send(state).is_err() {
                    break;
                }
            }
        });

        Self { state: rx, handle }
    }

    /// Most recently published status
    pub fn current(&self) -> ConnectedState {
        *self.state.borrow()
    }

    /// A receiver notified on every published status
    pub fn subscribe(&self) -> watch::Receiver<ConnectedState> {
        self.state.clone()
    }

    /// Stop checking
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
