//! `RocksDB` storage, the default for single-node deployments.
//!
//! `RocksDB` is synchronous, so each call hops onto the blocking pool.
//! It has no compare-and-swap of its own: mutations serialize on a
//! process-wide mutex held across the read and the write. Plain reads
//! skip the mutex.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options};

use crate::{StorageBackend, StorageError};

struct Inner {
    db: DBWithThreadMode<MultiThreaded>,
    writes: Mutex<()>,
    path: PathBuf,
}

impl Inner {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.db.get(key).map_err(|e| StorageError::Read {
            key: key.to_owned(),
            reason: e.to_string(),
        })
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.db.put(key, value).map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        })
    }

    /// Run `op` while holding the write mutex.
    fn exclusive<T>(&self, op: impl FnOnce() -> Result<T, StorageError>) -> Result<T, StorageError> {
        let _held = self.writes.lock().map_err(|_| StorageError::Transaction {
            reason: "write mutex poisoned".to_owned(),
        })?;
        op()
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mode = IteratorMode::From(prefix.as_bytes(), Direction::Forward);
        for item in self.db.iterator(mode) {
            let (raw_key, _) = item.map_err(|e| StorageError::List {
                prefix: prefix.to_owned(),
                reason: e.to_string(),
            })?;
            if !raw_key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = std::str::from_utf8(&raw_key).map_err(|e| StorageError::InvalidKey {
                reason: e.to_string(),
            })?;
            keys.push(key.to_owned());
        }
        Ok(keys)
    }
}

/// [`StorageBackend`] over a `RocksDB` directory.
#[derive(Clone)]
pub struct RocksDbBackend {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbBackend {
    /// Open the database directory at `path`, creating it when missing.
    ///
    /// # Errors
    ///
    /// [`StorageError::Open`] if `RocksDB` refuses the path (bad permissions,
    /// already locked by another process).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::open(&options, &path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                writes: Mutex::new(()),
                path,
            }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .unwrap_or_else(|e| {
                Err(StorageError::Transaction {
                    reason: format!("storage task failed: {e}"),
                })
            })
    }
}

#[async_trait::async_trait]
impl StorageBackend for RocksDbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_owned();
        self.run(move |db| db.read(&key)).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let key = key.to_owned();
        let value = value.to_vec();
        self.run(move |db| db.exclusive(|| db.write(&key, &value)))
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = key.to_owned();
        self.run(move |db| {
            db.exclusive(|| {
                db.db.delete(&key).map_err(|e| StorageError::Delete {
                    key: key.clone(),
                    reason: e.to_string(),
                })
            })
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.to_owned();
        self.run(move |db| db.keys_with_prefix(&prefix)).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        let key = key.to_owned();
        let expected = expected.map(<[u8]>::to_vec);
        let new = new.to_vec();
        self.run(move |db| {
            db.exclusive(|| {
                if db.read(&key)? != expected {
                    return Ok(false);
                }
                db.write(&key, &new)?;
                Ok(true)
            })
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_stops_at_prefix_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbBackend::open(dir.path()).unwrap();
        for key in ["secrets/a", "secrets/b", "secretz", "sys/seal"] {
            store.put(key, b"v").await.unwrap();
        }
        assert_eq!(
            store.list("secrets/").await.unwrap(),
            vec!["secrets/a", "secrets/b"]
        );
        store.delete("secrets/a").await.unwrap();
        assert!(!store.exists("secrets/a").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_swaps_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbBackend::open(dir.path()).unwrap();
        store.put("counter", b"0").await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.compare_and_swap("counter", Some(&b"0"[..]), &[i]).await.unwrap()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
