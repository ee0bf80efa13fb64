//! Channel registry
//!
//! Named write targets, each bound to the templates compiled from one
//! `INSERT` statement and the execution options fixed at add time. The map is
//! guarded by a read-write lock; channels are handed out as `Arc<Channel>`
//! so dispatch never holds the lock across I/O.

use parking_lot::RwLock;
use sqlsink_rdbc::connection::ExecutionOptions;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::template::{compile, Template};

/// A compiled write target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    id: String,
    sql: String,
    insert_template: Template,
    batch_template: Template,
    batch_prefix: String,
    options: ExecutionOptions,
}

impl Channel {
    /// Compile `sql` into a channel
    pub fn compile(
        id: impl Into<String>,
        sql: &str,
        options: ExecutionOptions,
    ) -> Result<Self, RegistryError> {
        let compiled = compile(sql)?;
        Ok(Self {
            id: id.into(),
            sql: sql.to_string(),
            insert_template: compiled.insert_template,
            batch_template: compiled.batch_template,
            batch_prefix: compiled.batch_prefix,
            options,
        })
    }

    /// Channel id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The SQL the channel was compiled from
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Template for single-record execution
    pub fn insert_template(&self) -> &Template {
        &self.insert_template
    }

    /// Template for one value tuple of a batch
    pub fn batch_template(&self) -> &Template {
        &self.batch_template
    }

    /// Statement head the batch tuples are appended to
    pub fn batch_prefix(&self) -> &str {
        &self.batch_prefix
    }

    /// Options every execution on this channel runs with
    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }
}

/// Linearizable registry of channels keyed by id
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl ChannelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register a channel.
    ///
    /// An existing binding under `id` is left untouched and reported as
    /// [`RegistryError::AlreadyExists`]. Compile errors propagate unchanged.
    pub fn add(
        &self,
        id: impl Into<String>,
        sql: &str,
        options: ExecutionOptions,
    ) -> Result<Arc<Channel>, RegistryError> {
        let id = id.into();
        if self.channels.read().contains_key(&id) {
            return Err(RegistryError::AlreadyExists { channel: id });
        }

        // Compile outside the lock; the insert below re-checks for a racing add
        let channel = Arc::new(Channel::compile(id.clone(), sql, options)?);

        let mut channels = self.channels.write();
        if channels.contains_key(&id) {
            return Err(RegistryError::AlreadyExists { channel: id });
        }
        channels.insert(id.clone(), channel.clone());
        drop(channels);

        info!(channel = %id, "Channel added");
        Ok(channel)
    }

    /// Remove a channel; removing an absent id is a no-op
    pub fn remove(&self, id: &str) {
        if self.channels.write().remove(id).is_some() {
            info!(channel = %id, "Channel removed");
        } else {
            debug!(channel = %id, "Channel not registered, nothing to remove");
        }
    }

    /// Look up a channel
    pub fn lookup(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(id).cloned()
    }

    /// Look up a channel, reporting absence as [`RegistryError::NotExists`]
    pub fn get(&self, id: &str) -> Result<Arc<Channel>, RegistryError> {
        self.lookup(id).ok_or_else(|| RegistryError::NotExists {
            channel: id.to_string(),
        })
    }

    /// Ids of every registered channel
    pub fn list(&self) -> BTreeSet<String> {
        self.channels.read().keys().cloned().collect()
    }

    /// Number of registered channels
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    /// Whether no channel is registered
    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}
