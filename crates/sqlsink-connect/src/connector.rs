//! Connector lifecycle
//!
//! A [`Connector`] owns one connection pool and one channel registry.
//! Producers submit records tagged with a channel id; the connector renders
//! them with the channel's templates and executes the result through the
//! pool.
//!
//! ```rust,ignore
//! let connector = Connector::start(&config, Arc::new(PgConnectionFactory)).await?;
//! connector.add_channel("readings", &ChannelConfig::new(
//!     "INSERT INTO readings (ts, v) VALUES (${ts}, ${v})",
//! ))?;
//!
//! let record = Record::new().with("ts", 1_700_000_000_i64).with("v", 21.5);
//! connector.query("readings", &record).await?;
//! ```

use sqlsink_rdbc::connection::ConnectionFactory;
use sqlsink_rdbc::pool::{ConnectionPool, SimpleConnectionPool};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channel::ChannelRegistry;
use crate::config::{ChannelConfig, ConnectorConfig};
use crate::error::{ConnectError, ExecError, RegistryError, Result};
use crate::executor::{execute, Job, QueryResult};
use crate::health::{pool_status, ConnectedState, HealthMonitor};
use crate::render::{render_with, MissingFieldPolicy, Record};

/// A running sink connector
pub struct Connector {
    pool_id: String,
    pool: Arc<dyn ConnectionPool>,
    channels: ChannelRegistry,
    missing_field: MissingFieldPolicy,
    health_check_interval: Duration,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("pool_id", &self.pool_id)
            .field("channels", &self.channels.list())
            .field("missing_field", &self.missing_field)
            .finish()
    }
}

impl Connector {
    /// Build the pool and register every configured channel.
    ///
    /// The pool is closed again if any configured channel fails to compile.
    pub async fn start(
        config: &ConnectorConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        config.check()?;

        let pool_config = config.pool_config()?;
        info!(
            connector = %config.name,
            url = %pool_config.connection.redacted_url(),
            backend = %factory.database_type(),
            pool_size = pool_config.max_size,
            "Starting connector"
        );

        let pool = SimpleConnectionPool::new(pool_config, factory).await?;
        let connector = Self::with_pool(config.name.clone(), pool, config.missing_field)
            .with_health_check_interval(config.health_check_interval());

        for (id, channel) in &config.channels {
            if let Err(source) = connector.add_channel(id.clone(), channel) {
                let _ = connector.pool.close().await;
                return Err(ConnectError::Channel {
                    channel: id.clone(),
                    source,
                });
            }
        }

        info!(
            connector = %connector.pool_id,
            channels = connector.channels.len(),
            "Connector started"
        );
        Ok(connector)
    }

    /// Wrap an existing pool with an empty channel registry
    pub fn with_pool(
        pool_id: impl Into<String>,
        pool: Arc<dyn ConnectionPool>,
        missing_field: MissingFieldPolicy,
    ) -> Self {
        Self {
            pool_id: pool_id.into(),
            pool,
            channels: ChannelRegistry::new(),
            missing_field,
            health_check_interval: Duration::from_millis(15_000),
        }
    }

    /// Set the interval used by [`spawn_health_monitor`](Self::spawn_health_monitor)
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Pool identifier (the connector name)
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// The underlying pool
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Whether the backend accepts the space-separated multi-row statements
    /// [`Connector::batch_query`] produces
    pub fn supports_batches(&self) -> bool {
        self.pool.database_type().accepts_space_separated_tuples()
    }

    /// Render `record` with the channel's insert template and execute it
    pub async fn query(
        &self,
        channel_id: &str,
        record: &Record,
    ) -> std::result::Result<QueryResult, ExecError> {
        let channel = self
            .channels
            .lookup(channel_id)
            .ok_or_else(|| ExecError::invalid_channel(channel_id))?;

        let sql = render_with(channel.insert_template(), record, self.missing_field);
        debug!(channel = %channel_id, "Executing single record");

        execute(
            self.pool.as_ref(),
            Job::Single {
                sql,
                options: channel.options(),
            },
        )
        .await
    }

    /// Aggregate records of one channel into a single multi-row statement.
    ///
    /// Every entry must name the same channel.
    pub async fn batch_query(
        &self,
        batch: &[(String, Record)],
    ) -> std::result::Result<QueryResult, ExecError> {
        let Some((channel_id, _)) = batch.first() else {
            return Err(ExecError::invalid_request("batch contains no records"));
        };
        if let Some((other, _)) = batch.iter().find(|(id, _)| id != channel_id) {
            return Err(ExecError::invalid_request(format!(
                "batch mixes channels '{}' and '{}'",
                channel_id, other
            )));
        }

        let channel = self
            .channels
            .lookup(channel_id)
            .ok_or_else(|| ExecError::invalid_channel(channel_id.as_str()))?;

        if !self.supports_batches() {
            return Err(ExecError::invalid_request(format!(
                "{} does not accept space-separated row tuples, send records one at a time",
                self.pool.database_type()
            )));
        }

        debug!(channel = %channel_id, records = batch.len(), "Executing batch");

        execute(
            self.pool.as_ref(),
            Job::Batch {
                template: channel.batch_template(),
                prefix: channel.batch_prefix(),
                records: batch.iter().map(|(_, record)| record).collect(),
                policy: self.missing_field,
                options: channel.options(),
            },
        )
        .await
    }

    /// Register a channel
    pub fn add_channel(
        &self,
        channel_id: impl Into<String>,
        config: &ChannelConfig,
    ) -> std::result::Result<(), RegistryError> {
        self.channels
            .add(channel_id, &config.sql, config.options())
            .map(|_| ())
    }

    /// Unregister a channel; absent ids are ignored
    pub fn remove_channel(&self, channel_id: &str) {
        self.channels.remove(channel_id);
    }

    /// Ids of every registered channel
    pub fn channels(&self) -> BTreeSet<String> {
        self.channels.list()
    }

    /// Status of a channel: the pool status, or `NotExists`
    pub async fn get_channel_status(
        &self,
        channel_id: &str,
    ) -> std::result::Result<ConnectedState, RegistryError> {
        self.channels.get(channel_id)?;
        Ok(self.get_status().await)
    }

    /// Aggregate pool status
    pub async fn get_status(&self) -> ConnectedState {
        let state = pool_status(self.pool.as_ref()).await;
        if !state.is_connected() {
            warn!(connector = %self.pool_id, %state, "Pool liveness check failed");
        }
        state
    }

    /// Start background health checks on the configured interval
    pub fn spawn_health_monitor(&self) -> HealthMonitor {
        HealthMonitor::spawn(self.pool.clone(), self.health_check_interval)
    }

    /// Close the pool; in-flight borrowed connections are discarded on return
    pub async fn stop(self) -> Result<()> {
        info!(connector = %self.pool_id, "Stopping connector");
        self.pool.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlsink_rdbc::testing::{MemoryBackend, MemoryConnectionFactory};

    fn config() -> ConnectorConfig {
        let mut config = ConnectorConfig::new("localhost:5432").with_channel(
            "readings",
            ChannelConfig::new("INSERT INTO readings (a,b) VALUES (${a},${b})")
                .with_database("telemetry"),
        );
        config.min_pool_size = 0;
        config.pool_size = 2;
        config
    }

    #[tokio::test]
    async fn test_start_registers_configured_channels() {
        let backend = MemoryBackend::new();
        let connector = Connector::start(
            &config(),
            Arc::new(MemoryConnectionFactory::new(backend.clone())),
        )
        .await
        .unwrap();

        assert_eq!(connector.pool_id(), "sqlsink");
        assert_eq!(
            connector.channels().into_iter().collect::<Vec<_>>(),
            vec!["readings".to_string()]
        );
    }

    #[tokio::test]
    async fn test_start_fails_on_bad_channel() {
        let backend = MemoryBackend::new();
        let config = config().with_channel("broken", ChannelConfig::new("SELECT 1"));

        let err = Connector::start(&config, Arc::new(MemoryConnectionFactory::new(backend)))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Channel { ref channel, .. } if channel == "broken"));
    }

    #[tokio::test]
    async fn test_batch_query_validation() {
        let backend = MemoryBackend::new();
        let connector = Connector::start(
            &config(),
            Arc::new(MemoryConnectionFactory::new(backend.clone())),
        )
        .await
        .unwrap();

        let err = connector.batch_query(&[]).await.unwrap_err();
        assert!(!err.is_recoverable());

        let record = Record::new().with("a", 1).with("b", 2);
        let mixed = vec![
            ("readings".to_string(), record.clone()),
            ("other".to_string(), record),
        ];
        let err = connector.batch_query(&mixed).await.unwrap_err();
        assert!(err.to_string().contains("mixes channels"));
        assert!(backend.statements().is_empty());
    }
}
