//! Error types for sqlsink-connect
//!
//! Errors are split by the point at which they arise:
//! - [`ParseError`]: compiling a channel's SQL (channel-add time)
//! - [`RegistryError`]: adding or resolving channels
//! - [`ExecError`]: executing a query, tagged recoverable or not
//! - [`ConnectError`]: starting and stopping a connector

use sqlsink_rdbc::pool::PoolError;
use thiserror::Error;

/// Result type alias for connector lifecycle operations
pub type Result<T> = std::result::Result<T, ConnectError>;

/// A channel's SQL could not be compiled into templates
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The statement is recognizable SQL but not an INSERT
    #[error("unsupported statement type '{statement}': only INSERT is accepted")]
    UnsupportedStatementType { statement: String },

    /// No statement keyword could be found at the start of the text
    #[error("could not detect statement type of '{sql}'")]
    DetectionFailed { sql: String },

    /// The statement did not split into an `INSERT INTO` head and a value body
    #[error("could not split '{sql}' into INSERT INTO and a VALUES body (parts: {parts:?})")]
    SplitFailed { sql: String, parts: Vec<String> },
}

/// Channel registry failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A channel with this id is already registered
    #[error("channel '{channel}' already exists")]
    AlreadyExists { channel: String },

    /// No channel with this id is registered
    #[error("channel '{channel}' does not exist")]
    NotExists { channel: String },

    /// The channel's SQL failed to compile
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Permanent query failures; retrying the same request cannot succeed
#[derive(Debug, Error)]
pub enum UnrecoverableError {
    /// The driver rejected the statement or lost the connection mid-flight
    #[error("driver error: {0}")]
    Driver(#[source] sqlsink_rdbc::Error),

    /// The request named a channel that is not registered
    #[error("invalid channel '{channel}'")]
    InvalidChannel { channel: String },

    /// The request itself is malformed (empty or mixed-channel batch, ...)
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl UnrecoverableError {
    /// Create an invalid request error
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

/// Query execution failure, classified for the caller's retry policy
#[derive(Debug, Error)]
pub enum ExecError {
    /// No pooled connection was available; retry after backoff
    #[error("recoverable: {0}")]
    Recoverable(#[source] sqlsink_rdbc::Error),

    /// Anything else; surface to the producer
    #[error(transparent)]
    Unrecoverable(#[from] UnrecoverableError),
}

impl ExecError {
    /// Whether the caller should retry the request later
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }

    /// The underlying driver error, if the failure came from the pool or driver
    pub fn driver_error(&self) -> Option<&sqlsink_rdbc::Error> {
        match self {
            Self::Recoverable(e) | Self::Unrecoverable(UnrecoverableError::Driver(e)) => Some(e),
            Self::Unrecoverable(_) => None,
        }
    }

    pub(crate) fn invalid_channel(channel: impl Into<String>) -> Self {
        Self::Unrecoverable(UnrecoverableError::InvalidChannel {
            channel: channel.into(),
        })
    }

    pub(crate) fn invalid_request(reason: impl Into<String>) -> Self {
        Self::Unrecoverable(UnrecoverableError::invalid_request(reason))
    }
}

impl From<PoolError> for ExecError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Empty(e) => Self::Recoverable(e),
            PoolError::Driver(e) => Self::Unrecoverable(UnrecoverableError::Driver(e)),
        }
    }
}

/// Connector lifecycle errors
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Pool construction or shutdown failed
    #[error(transparent)]
    Driver(#[from] sqlsink_rdbc::Error),

    /// A configured channel could not be registered
    #[error("channel '{channel}': {source}")]
    Channel {
        channel: String,
        #[source]
        source: RegistryError,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
