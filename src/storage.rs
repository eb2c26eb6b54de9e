//! Storage backends.
//!
//! The relational engine is an external collaborator; the gateway only knows
//! the [`Storage`] trait. [`MySqlStorage`] is the production implementation
//! over the original schema (`device`, `eventdata`, `devicelatestdata`,
//! `commands` joined to `commandtypes`). [`MemoryStorage`] backs unit and
//! integration tests and counts queries so cache behavior is observable.
//!
//! The event append and the latest-position upsert are two independent
//! statements with no transaction between them; a failure after the first
//! leaves `devicelatestdata` behind `eventdata`. Known inconsistency,
//! inherited and documented rather than silently fixed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};

use crate::commands::{Command, CommandStatus};
use crate::error::Result;

/// One row of the device identity table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRow {
    /// Internal device id.
    pub id: String,
    /// Hardware identity key.
    pub imei: String,
}

/// A normalized, storage-ready telemetry record.
///
/// Coordinates are carried as strings; `"0","0"` means the position could
/// not be resolved and only the ack/time fields of the latest-position row
/// are updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Internal device id (already resolved from the imei).
    pub device_id: String,
    /// GPS timestamp, epoch milliseconds.
    pub timestamp_ms: i64,
    /// Latitude in decimal degrees, or "0".
    pub latitude: String,
    /// Longitude in decimal degrees, or "0".
    pub longitude: String,
    /// Speed field as reported, or "0".
    pub speed: String,
    /// Heading field as reported, or "0".
    pub heading: String,
}

impl EventRecord {
    /// Whether the position could not be resolved.
    pub fn position_unresolved(&self) -> bool {
        self.latitude == "0" && self.longitude == "0"
    }
}

/// Storage operations the gateway core depends on.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Identity lookup by imei.
    async fn device_by_imei(&self, imei: &str) -> Result<Option<DeviceRow>>;

    /// Identity lookup by internal id.
    async fn device_by_id(&self, id: &str) -> Result<Option<DeviceRow>>;

    /// All commands currently PENDING, across devices.
    async fn pending_commands(&self) -> Result<Vec<Command>>;

    /// The PENDING command for one `(device id, kind)` key, if any.
    async fn pending_command(&self, device_id: &str, kind: &str) -> Result<Option<Command>>;

    /// Commit a command lifecycle transition.
    async fn commit_command(&self, command_id: &str, status: CommandStatus) -> Result<()>;

    /// Append the telemetry event and upsert the latest-position row.
    async fn save_event(&self, record: &EventRecord) -> Result<()>;
}

/// MySQL-backed storage over the original gateway schema.
pub struct MySqlStorage {
    pool: MySqlPool,
}

impl MySqlStorage {
    /// Connect a pool sized to the configured persistence parallelism.
    pub async fn connect(url: &str, max_conns: u32) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_conns)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    fn row_to_command(row: &sqlx::mysql::MySqlRow) -> sqlx::Result<Command> {
        Ok(Command {
            id: row.try_get("id")?,
            device_id: row.try_get("deviceId")?,
            kind: row.try_get("type")?,
            params: row.try_get("params")?,
            status: CommandStatus::Pending,
        })
    }
}

#[async_trait]
impl Storage for MySqlStorage {
    async fn device_by_imei(&self, imei: &str) -> Result<Option<DeviceRow>> {
        let row = sqlx::query("SELECT id, deviceImei FROM device WHERE deviceImei = ?")
            .bind(imei)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(DeviceRow {
                id: row.try_get("id")?,
                imei: row.try_get("deviceImei")?,
            }),
            None => None,
        })
    }

    async fn device_by_id(&self, id: &str) -> Result<Option<DeviceRow>> {
        let row = sqlx::query("SELECT id, deviceImei FROM device WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(DeviceRow {
                id: row.try_get("id")?,
                imei: row.try_get("deviceImei")?,
            }),
            None => None,
        })
    }

    async fn pending_commands(&self) -> Result<Vec<Command>> {
        let rows = sqlx::query(
            "SELECT a.id, a.deviceId, b.type, a.params FROM commands AS a \
             LEFT OUTER JOIN commandtypes AS b ON a.type = b.id \
             WHERE a.status = 'PENDING'",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(Self::row_to_command(row)?);
        }
        Ok(out)
    }

    async fn pending_command(&self, device_id: &str, kind: &str) -> Result<Option<Command>> {
        let row = sqlx::query(
            "SELECT a.id, a.deviceId, b.type, a.params FROM commands AS a \
             LEFT OUTER JOIN commandtypes AS b ON a.type = b.id \
             WHERE a.status = 'PENDING' AND a.deviceId = ? AND b.type = ?",
        )
        .bind(device_id)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(Self::row_to_command(&row)?),
            None => None,
        })
    }

    async fn commit_command(&self, command_id: &str, status: CommandStatus) -> Result<()> {
        sqlx::query("UPDATE commands SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(command_id)
            .execute(&self.pool)
            .await?;
        tracing::debug!(command_id, %status, "committed command status");
        Ok(())
    }

    async fn save_event(&self, record: &EventRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO eventdata(deviceId, timestamp, latitude, longitude, speed, heading) \
             VALUES(?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.device_id)
        .bind(record.timestamp_ms)
        .bind(&record.latitude)
        .bind(&record.longitude)
        .bind(&record.speed)
        .bind(&record.heading)
        .execute(&self.pool)
        .await?;

        if record.position_unresolved() {
            sqlx::query(
                "UPDATE devicelatestdata SET lastAckTime = ?, speed = ?, heading = ?, \
                 gpsTimestamp = ?, updateTime = ? WHERE deviceId = ?",
            )
            .bind(record.timestamp_ms)
            .bind(&record.speed)
            .bind(&record.heading)
            .bind(record.timestamp_ms)
            .bind(record.timestamp_ms)
            .bind(&record.device_id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE devicelatestdata SET lastAckTime = ?, latitude = ?, longitude = ?, \
                 speed = ?, heading = ?, gpsTimestamp = ?, updateTime = ? WHERE deviceId = ?",
            )
            .bind(record.timestamp_ms)
            .bind(&record.latitude)
            .bind(&record.longitude)
            .bind(&record.speed)
            .bind(&record.heading)
            .bind(record.timestamp_ms)
            .bind(record.timestamp_ms)
            .bind(&record.device_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

struct StoredCommand {
    command: Command,
    /// Replaced by a newer row for the same key; hidden from pending queries.
    superseded: bool,
    commits: u32,
}

#[derive(Default)]
struct MemoryState {
    devices: Vec<DeviceRow>,
    commands: HashMap<String, StoredCommand>,
    events: Vec<EventRecord>,
    latest: HashMap<String, EventRecord>,
}

/// In-memory storage double for tests and demos.
///
/// Counts device queries so directory caching is observable, and can be
/// told to fail saves to exercise the persistence error path.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
    device_queries: AtomicU64,
    fail_saves: AtomicBool,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed one identity row.
    pub fn push_device(&self, id: &str, imei: &str) {
        self.state.lock().devices.push(DeviceRow {
            id: id.to_string(),
            imei: imei.to_string(),
        });
    }

    /// Insert a command row.
    pub fn push_command(&self, command: Command) {
        self.state.lock().commands.insert(
            command.id.clone(),
            StoredCommand {
                command,
                superseded: false,
                commits: 0,
            },
        );
    }

    /// Insert a command row replacing the pending one for the same key.
    ///
    /// The replaced row stays visible to [`Storage::commit_command`] (its
    /// status is still whatever was last committed) but no longer shows up
    /// in pending queries, mirroring a newer row shadowing an older one.
    pub fn replace_command(&self, command: Command) {
        let mut state = self.state.lock();
        for stored in state.commands.values_mut() {
            if stored.command.device_id == command.device_id
                && stored.command.kind == command.kind
            {
                stored.superseded = true;
            }
        }
        state.commands.insert(
            command.id.clone(),
            StoredCommand {
                command,
                superseded: false,
                commits: 0,
            },
        );
    }

    /// Delete a command row entirely.
    pub fn remove_command(&self, id: &str) {
        self.state.lock().commands.remove(id);
    }

    /// Last committed status of a command row.
    pub fn command_status(&self, id: &str) -> Option<CommandStatus> {
        self.state.lock().commands.get(id).map(|s| s.command.status)
    }

    /// How many times a row's status has been committed.
    pub fn commit_count(&self, id: &str) -> u32 {
        self.state
            .lock()
            .commands
            .get(id)
            .map(|s| s.commits)
            .unwrap_or(0)
    }

    /// Number of identity queries served (cache-miss observability).
    pub fn device_queries(&self) -> u64 {
        self.device_queries.load(Ordering::Relaxed)
    }

    /// All appended event rows.
    pub fn events(&self) -> Vec<EventRecord> {
        self.state.lock().events.clone()
    }

    /// Latest-position row for one device.
    pub fn latest(&self, device_id: &str) -> Option<EventRecord> {
        self.state.lock().latest.get(device_id).cloned()
    }

    /// Make subsequent saves fail with a storage error.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn device_by_imei(&self, imei: &str) -> Result<Option<DeviceRow>> {
        self.device_queries.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .state
            .lock()
            .devices
            .iter()
            .find(|d| d.imei == imei)
            .cloned())
    }

    async fn device_by_id(&self, id: &str) -> Result<Option<DeviceRow>> {
        self.device_queries.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .state
            .lock()
            .devices
            .iter()
            .find(|d| d.id == id)
            .cloned())
    }

    async fn pending_commands(&self) -> Result<Vec<Command>> {
        Ok(self
            .state
            .lock()
            .commands
            .values()
            .filter(|s| !s.superseded && s.command.status == CommandStatus::Pending)
            .map(|s| s.command.clone())
            .collect())
    }

    async fn pending_command(&self, device_id: &str, kind: &str) -> Result<Option<Command>> {
        Ok(self
            .state
            .lock()
            .commands
            .values()
            .find(|s| {
                !s.superseded
                    && s.command.status == CommandStatus::Pending
                    && s.command.device_id == device_id
                    && s.command.kind == kind
            })
            .map(|s| s.command.clone()))
    }

    async fn commit_command(&self, command_id: &str, status: CommandStatus) -> Result<()> {
        if let Some(stored) = self.state.lock().commands.get_mut(command_id) {
            stored.command.status = status;
            stored.commits += 1;
        }
        Ok(())
    }

    async fn save_event(&self, record: &EventRecord) -> Result<()> {
        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(sqlx::Error::PoolClosed.into());
        }
        let mut state = self.state.lock();
        state.events.push(record.clone());
        let entry = state
            .latest
            .entry(record.device_id.clone())
            .or_insert_with(|| record.clone());
        if record.position_unresolved() {
            // Keep the last known position, refresh the ack/time fields.
            entry.timestamp_ms = record.timestamp_ms;
            entry.speed = record.speed.clone();
            entry.heading = record.heading.clone();
        } else {
            *entry = record.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_identity_lookup_counts_queries() {
        let storage = MemoryStorage::new();
        storage.push_device("42", "WORLD123");
        let row = storage.device_by_imei("WORLD123").await.unwrap().unwrap();
        assert_eq!(row.id, "42");
        assert!(storage.device_by_imei("nope").await.unwrap().is_none());
        assert_eq!(storage.device_queries(), 2);
    }

    #[tokio::test]
    async fn test_unresolved_position_keeps_last_known_coordinates() {
        let storage = MemoryStorage::new();
        let fix = EventRecord {
            device_id: "42".into(),
            timestamp_ms: 1000,
            latitude: "30.100000".into(),
            longitude: "120.200000".into(),
            speed: "5".into(),
            heading: "90".into(),
        };
        storage.save_event(&fix).await.unwrap();

        let ack_only = EventRecord {
            device_id: "42".into(),
            timestamp_ms: 2000,
            latitude: "0".into(),
            longitude: "0".into(),
            speed: "0".into(),
            heading: "0".into(),
        };
        storage.save_event(&ack_only).await.unwrap();

        let latest = storage.latest("42").unwrap();
        assert_eq!(latest.latitude, "30.100000");
        assert_eq!(latest.longitude, "120.200000");
        assert_eq!(latest.timestamp_ms, 2000);
        assert_eq!(storage.events().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_saves_surface_storage_error() {
        let storage = MemoryStorage::new();
        storage.set_fail_saves(true);
        let record = EventRecord {
            device_id: "42".into(),
            timestamp_ms: 0,
            latitude: "0".into(),
            longitude: "0".into(),
            speed: "0".into(),
            heading: "0".into(),
        };
        assert!(storage.save_event(&record).await.is_err());
        assert!(storage.events().is_empty());
    }
}
