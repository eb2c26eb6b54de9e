//! Device directory: the imei <-> internal-id resolution cache.
//!
//! Lazily populated from storage; every protocol handler resolves identities
//! through it. Entries are never evicted or expired within the process
//! lifetime, so an external imei rename is only observed after a restart.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{GatewayError, Result};
use crate::storage::Storage;

#[derive(Default)]
struct Maps {
    imei_to_id: HashMap<String, String>,
    id_to_imei: HashMap<String, String>,
}

/// Bidirectional identity cache.
///
/// The maps are owned privately and guarded by one mutex; callers only see
/// the resolve operations (worker tasks hit this concurrently).
pub struct DeviceDirectory {
    maps: Mutex<Maps>,
    storage: Arc<dyn Storage>,
}

impl DeviceDirectory {
    /// Create an empty directory over the given storage backend.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
            storage,
        }
    }

    /// Resolve an imei to the internal device id.
    ///
    /// Cache hit returns immediately; a miss performs one storage query and
    /// populates both directions. An absent device is
    /// [`GatewayError::DeviceUnknown`]; negative results are not cached.
    pub async fn resolve_id_by_imei(&self, imei: &str) -> Result<String> {
        if let Some(id) = self.maps.lock().imei_to_id.get(imei) {
            return Ok(id.clone());
        }
        match self.storage.device_by_imei(imei).await? {
            Some(row) => {
                self.insert(&row.imei, &row.id);
                Ok(row.id)
            }
            None => Err(GatewayError::DeviceUnknown(imei.to_string())),
        }
    }

    /// Resolve an internal device id back to its imei.
    pub async fn resolve_imei_by_id(&self, id: &str) -> Result<String> {
        if let Some(imei) = self.maps.lock().id_to_imei.get(id) {
            return Ok(imei.clone());
        }
        match self.storage.device_by_id(id).await? {
            Some(row) => {
                self.insert(&row.imei, &row.id);
                Ok(row.imei)
            }
            None => Err(GatewayError::DeviceUnknown(format!("id:{id}"))),
        }
    }

    fn insert(&self, imei: &str, id: &str) {
        let mut maps = self.maps.lock();
        maps.imei_to_id.insert(imei.to_string(), id.to_string());
        maps.id_to_imei.insert(id.to_string(), imei.to_string());
    }

    /// Number of cached identities.
    pub fn len(&self) -> usize {
        self.maps.lock().imei_to_id.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_first_resolve_queries_once_and_fills_both_directions() {
        let storage = Arc::new(MemoryStorage::new());
        storage.push_device("42", "WORLD123");
        let directory = DeviceDirectory::new(storage.clone());

        assert_eq!(directory.resolve_id_by_imei("WORLD123").await.unwrap(), "42");
        assert_eq!(storage.device_queries(), 1);

        // Second lookup and the reverse direction are both cache hits.
        assert_eq!(directory.resolve_id_by_imei("WORLD123").await.unwrap(), "42");
        assert_eq!(directory.resolve_imei_by_id("42").await.unwrap(), "WORLD123");
        assert_eq!(storage.device_queries(), 1);
    }

    #[tokio::test]
    async fn test_unknown_imei_not_cached() {
        let storage = Arc::new(MemoryStorage::new());
        let directory = DeviceDirectory::new(storage.clone());

        assert!(matches!(
            directory.resolve_id_by_imei("GHOST").await,
            Err(GatewayError::DeviceUnknown(_))
        ));
        // A later registration is picked up: negatives were not cached.
        storage.push_device("7", "GHOST");
        assert_eq!(directory.resolve_id_by_imei("GHOST").await.unwrap(), "7");
        assert_eq!(storage.device_queries(), 2);
    }

    #[tokio::test]
    async fn test_resolve_by_id_miss_populates_cache() {
        let storage = Arc::new(MemoryStorage::new());
        storage.push_device("42", "WORLD123");
        let directory = DeviceDirectory::new(storage.clone());

        assert_eq!(directory.resolve_imei_by_id("42").await.unwrap(), "WORLD123");
        assert_eq!(directory.resolve_id_by_imei("WORLD123").await.unwrap(), "42");
        assert_eq!(storage.device_queries(), 1);
    }
}
