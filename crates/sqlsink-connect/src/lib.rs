//! sqlsink-connect - Templated SQL data-sink connector
//!
//! A connector holds a pool of live database connections and a set of named
//! **write channels**, each bound to one parameterized `INSERT` statement.
//! Producers submit records tagged with a channel id; the connector renders
//! them into SQL and executes the result singly or as one multi-row batch.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────────┐   ┌──────────┐
//! │ producer │──▶│   channel    │──▶│ render/aggregate │──▶│ executor │──▶ pool
//! │ (record) │   │   registry   │   │   (templates)    │   │          │
//! └──────────┘   └──────────────┘   └──────────────────┘   └──────────┘
//! ```
//!
//! - [`template`]: compiles `INSERT` statements into insert and batch templates
//! - [`render`]: substitutes `${field}` placeholders from a [`Record`]
//! - [`batch`]: folds many records into one statement
//! - [`channel`]: registry of compiled channels
//! - [`executor`]: dispatch and recoverable/unrecoverable classification
//! - [`health`]: liveness checks and aggregate status
//! - [`connector`]: lifecycle tying it all together
//!
//! # CLI Usage (Binary)
//!
//! ```bash
//! # Validate configuration and compile every channel
//! sqlsink-connect -c sqlsink.yaml validate
//!
//! # Connect and print connector and channel status
//! sqlsink-connect -c sqlsink.yaml status
//!
//! # Stream NDJSON {"channel": .., "record": {..}} lines from stdin
//! sqlsink-connect -c sqlsink.yaml ingest --batch-size 500
//! ```

pub mod batch;
pub mod channel;
pub mod config;
pub mod connector;
pub mod error;
pub mod executor;
pub mod health;
pub mod render;
pub mod template;
pub mod types;

pub use types::SensitiveString;

pub use channel::{Channel, ChannelRegistry};
pub use config::{ChannelConfig, ConnectorConfig};
pub use connector::Connector;
pub use error::{
    ConnectError, ExecError, ParseError, RegistryError, Result, UnrecoverableError,
};
pub use executor::{execute, Job, QueryResult};
pub use health::{ConnectedState, HealthMonitor};
pub use render::{render, MissingFieldPolicy, Record};
pub use template::{compile, CompiledSql, Template};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{aggregate, BATCH_COMMAND_PREFIX};
    pub use crate::{
        compile, render, ChannelConfig, CompiledSql, ConnectError, ConnectedState, Connector,
        ConnectorConfig, ExecError, MissingFieldPolicy, ParseError, QueryResult, Record,
        RegistryError, SensitiveString, Template, UnrecoverableError,
    };
    pub use sqlsink_rdbc::connection::{ConnectionFactory, ExecutionOptions};
    pub use sqlsink_rdbc::Value;
}
