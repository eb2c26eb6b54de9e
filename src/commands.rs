//! Pending-command cache and dispatch lifecycle.
//!
//! Storage is the source of truth for server-to-device commands; this module
//! mirrors the PENDING subset in memory so protocol handlers can dispatch
//! without a storage round trip on every packet. The cache is keyed by
//! `(device id, command kind)`, with at most one live command per key.
//!
//! Lifecycle: rows are inserted externally as PENDING, merged into the cache
//! by the periodic refresh, dispatched by vendor encoders when the device is
//! next observed, and committed back as APPLIED / OVERWRITE / INVALID /
//! DELETED.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::storage::Storage;

/// Command kind: change the reporting interval.
pub const CMD_KIND_REPORT_INTERVAL: &str = "REPINTV";
/// Command kind: change the server address.
pub const CMD_KIND_SERVER_ADDR: &str = "SRVADDR";

/// Lifecycle status of a command row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Waiting for the device to be observed.
    Pending,
    /// Encoded and written to the device.
    Applied,
    /// Superseded by a newer row for the same key.
    Overwrite,
    /// Removed from the pending set.
    Deleted,
    /// Parameters failed validation; never retried.
    Invalid,
}

impl CommandStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Applied => "APPLIED",
            CommandStatus::Overwrite => "OVERWRITE",
            CommandStatus::Deleted => "DELETED",
            CommandStatus::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server-to-device instruction mirrored from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Storage row id.
    pub id: String,
    /// Internal device id.
    pub device_id: String,
    /// Command kind (e.g. [`CMD_KIND_REPORT_INTERVAL`]).
    pub kind: String,
    /// Kind-specific parameter string.
    pub params: String,
    /// Current lifecycle status.
    pub status: CommandStatus,
}

impl Command {
    fn key(&self) -> CommandKey {
        CommandKey {
            device_id: self.device_id.clone(),
            kind: self.kind.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CommandKey {
    device_id: String,
    kind: String,
}

/// In-memory mirror of the PENDING command rows.
///
/// All map access goes through one mutex; the raw map is never exposed
/// (many worker tasks and the refresh task mutate it concurrently).
pub struct CommandCache {
    entries: Mutex<HashMap<CommandKey, Command>>,
    storage: Arc<dyn Storage>,
}

impl CommandCache {
    /// Create an empty cache over the given storage backend.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            storage,
        }
    }

    /// Look up the cached command for `(device_id, kind)`.
    pub fn get(&self, device_id: &str, kind: &str) -> Option<Command> {
        let key = CommandKey {
            device_id: device_id.to_string(),
            kind: kind.to_string(),
        };
        self.entries.lock().get(&key).cloned()
    }

    /// All cached commands for one device, any kind.
    pub fn commands_for(&self, device_id: &str) -> Vec<Command> {
        self.entries
            .lock()
            .values()
            .filter(|c| c.device_id == device_id)
            .cloned()
            .collect()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Pull all PENDING rows from storage and merge them in.
    pub async fn refresh(&self) -> Result<()> {
        let rows = self.storage.pending_commands().await?;
        for row in rows {
            self.merge_row(row).await?;
        }
        Ok(())
    }

    /// Merge one refreshed PENDING row by key.
    ///
    /// A cached entry with a different id is stale: it is committed to
    /// storage as OVERWRITE before the new row takes its place. Matching
    /// ids adopt the refreshed status.
    async fn merge_row(&self, row: Command) -> Result<()> {
        let stale = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&row.key()) {
                Some(existing) if existing.id != row.id => {
                    let stale = existing.clone();
                    existing.id = row.id.clone();
                    existing.params = row.params.clone();
                    existing.status = row.status;
                    Some(stale)
                }
                Some(existing) => {
                    existing.params = row.params.clone();
                    existing.status = row.status;
                    None
                }
                None => {
                    tracing::debug!(device_id = %row.device_id, kind = %row.kind, id = %row.id,
                        "cached new pending command");
                    entries.insert(row.key(), row);
                    None
                }
            }
        };
        if let Some(stale) = stale {
            tracing::debug!(old_id = %stale.id, "overwriting stale cached command");
            self.storage
                .commit_command(&stale.id, CommandStatus::Overwrite)
                .await?;
        }
        Ok(())
    }

    /// Check out a PENDING command for dispatch.
    ///
    /// The authoritative row is re-fetched to cover the window between two
    /// refresh cycles: a vanished row drops the cache entry, an id mismatch
    /// commits OVERWRITE for the cached id and adopts the fresh row. The
    /// returned command is ready for kind-specific encoding.
    pub async fn checkout(&self, device_id: &str, kind: &str) -> Result<Option<Command>> {
        let cached = match self.get(device_id, kind) {
            Some(c) if c.status == CommandStatus::Pending => c,
            _ => return Ok(None),
        };

        let fresh = self.storage.pending_command(device_id, kind).await?;
        let key = cached.key();
        match fresh {
            None => {
                self.entries.lock().remove(&key);
                tracing::debug!(device_id, kind, "pending command vanished, dropped from cache");
                Ok(None)
            }
            Some(fresh) => {
                if cached.id != fresh.id {
                    self.storage
                        .commit_command(&cached.id, CommandStatus::Overwrite)
                        .await?;
                }
                let mut entries = self.entries.lock();
                if let Some(entry) = entries.get_mut(&key) {
                    entry.id = fresh.id.clone();
                    entry.params = fresh.params.clone();
                }
                Ok(Some(Command {
                    id: fresh.id,
                    device_id: device_id.to_string(),
                    kind: kind.to_string(),
                    params: fresh.params,
                    status: CommandStatus::Pending,
                }))
            }
        }
    }

    /// Record a dispatch outcome: update the cache and commit to storage
    /// synchronously.
    pub async fn mark(&self, command: &Command, status: CommandStatus) -> Result<()> {
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&command.key()) {
                entry.status = status;
            }
        }
        self.storage.commit_command(&command.id, status).await
    }

    /// Spawn the fixed-interval refresh task.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so startup is not
            // racing storage connection setup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = cache.refresh().await {
                    tracing::error!(%err, "command refresh failed");
                }
            }
        })
    }
}
