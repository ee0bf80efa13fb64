//! PostgreSQL backend implementation for sqlsink-rdbc
//!
//! Statements arrive fully rendered, so everything goes through the simple
//! query protocol: no prepared statements, no bound parameters. Result rows
//! come back as text and are surfaced as [`Value::String`] cells.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::SimpleQueryMessage;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType};
use crate::error::{Error, Result};
use crate::security::quote_identifier;
use crate::types::{Row, Value};

/// SQLSTATE class for integrity constraint violations
const INTEGRITY_CONSTRAINT_CLASS: &str = "23";

/// Map a tokio-postgres error onto a categorized driver error
fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if e.is_closed() {
        return Error::connection_with_source("connection closed", e);
    }

    if let Some(db) = e.as_db_error() {
        if db.code().code().starts_with(INTEGRITY_CONSTRAINT_CLASS) {
            return Error::Constraint {
                constraint_name: db.constraint().unwrap_or("unknown").to_string(),
                message: db.message().to_string(),
            };
        }
        if *db.code() == SqlState::QUERY_CANCELED {
            return Error::timeout(db.message().to_string());
        }
        if *db.code() == SqlState::INVALID_PASSWORD
            || *db.code() == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
        {
            return Error::Authentication {
                message: db.message().to_string(),
            };
        }
    }

    Error::Query {
        message: e.to_string(),
        sql: Some(sql.to_string()),
        source: Some(Box::new(e)),
    }
}

/// Convert simple-protocol text rows into sqlsink rows
fn simple_rows(messages: &[SimpleQueryMessage]) -> Vec<Row> {
    messages
        .iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => {
                let columns = row
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect();
                let values = (0..row.len())
                    .map(|i| match row.get(i) {
                        Some(text) => Value::String(text.to_string()),
                        None => Value::Null,
                    })
                    .collect();
                Some(Row::new(columns, values))
            }
            _ => None,
        })
        .collect()
}

/// Sum of affected rows over every command in a (possibly multi-statement) batch
fn affected_rows(messages: &[SimpleQueryMessage]) -> u64 {
    messages
        .iter()
        .map(|msg| match msg {
            SimpleQueryMessage::CommandComplete(n) => *n,
            _ => 0,
        })
        .sum()
}

/// Statement pointing the session at `database`, or back at the
/// connect-time default
fn search_path_sql(database: Option<&str>) -> Result<String> {
    match database {
        Some(database) => Ok(format!("SET search_path TO {}", quote_identifier(database)?)),
        None => Ok("RESET search_path".to_string()),
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: tokio_postgres::Client,
    closed: AtomicBool,
    /// Schema the session's search_path currently points at
    search_path: Mutex<Option<String>>,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
            search_path: Mutex::new(None),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }

    async fn simple_query(&self, sql: &str) -> Result<Vec<SimpleQueryMessage>> {
        self.ensure_open()?;
        self.client
            .simple_query(sql)
            .await
            .map_err(|e| map_pg_error(e, sql))
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let messages = self.simple_query(sql).await?;
        Ok(simple_rows(&messages))
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let messages = self.simple_query(sql).await?;
        Ok(affected_rows(&messages))
    }

    async fn use_database(&self, database: Option<&str>) -> Result<()> {
        // PostgreSQL cannot switch databases mid-session; schemas stand in
        let current = self.search_path.lock().clone();
        if current.as_deref() == database {
            return Ok(());
        }
        self.simple_query(&search_path_sql(database)?).await?;
        *self.search_path.lock() = database.map(str::to_string);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed) || self.client.is_closed()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::connection_with_source("invalid connection url", e))?;

        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        pg_config.connect_timeout(connect_timeout);
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let (client, connection) =
            tokio::time::timeout(connect_timeout, pg_config.connect(tokio_postgres::NoTls))
                .await
                .map_err(|_| {
                    Error::timeout(format!(
                        "connect to {} exceeded {}ms",
                        config.redacted_url(),
                        config.connect_timeout_ms
                    ))
                })?
                .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "PostgreSQL connection task failed");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}

/// Connect to PostgreSQL database
pub async fn connect(url: &str) -> Result<Box<dyn Connection>> {
    PgConnectionFactory
        .connect(&ConnectionConfig::new(url))
        .await
}
