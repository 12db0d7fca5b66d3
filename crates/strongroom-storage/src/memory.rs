//! Process-local storage: a sorted map behind a `tokio` lock.
//!
//! Clones share one map. Used by every test in the workspace and by the
//! server's `memory` mode.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::{StorageBackend, StorageError};

type Map = BTreeMap<String, Vec<u8>>;

/// In-memory [`StorageBackend`]. Nothing survives the process.
///
/// ```
/// # use strongroom_storage::{MemoryBackend, StorageBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let store = MemoryBackend::new();
/// assert!(store.compare_and_swap("sys/leases/a", None, b"1").await.unwrap());
/// assert!(!store.compare_and_swap("sys/leases/a", None, b"2").await.unwrap());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    map: Arc<RwLock<Map>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.map.write().await.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.map.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let map = self.map.read().await;
        Ok(map
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        let mut map = self.map.write().await;
        let matches = map.get(key).map(Vec::as_slice) == expected;
        if matches {
            map.insert(key.to_owned(), new.to_vec());
        } else {
            debug!(key, "compare-and-swap lost");
        }
        Ok(matches)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.map.read().await.contains_key(key))
    }
}
