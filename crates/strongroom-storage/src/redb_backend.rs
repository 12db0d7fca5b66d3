//! redb storage: a pure-Rust embedded alternative to `RocksDB`.
//!
//! One table, `kv`, holds everything. redb allows a single write
//! transaction at a time, which makes compare-and-swap a plain
//! read-then-insert inside one transaction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, Table, TableDefinition};

use crate::{StorageBackend, StorageError};

const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// [`StorageBackend`] over a redb file.
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn txn_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
}

fn table_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::MissingTable {
        name: format!("kv ({e})"),
    }
}

impl RedbBackend {
    /// Open the database file at `path`, creating it and the `kv` table if
    /// needed.
    ///
    /// # Errors
    ///
    /// [`StorageError::Open`] if the file cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        write_txn(&db, |_| Ok(((), true)))?;
        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .unwrap_or_else(|e| Err(txn_err(format!("storage task failed: {e}"))))
    }
}

/// Run `op` in a write transaction. It returns its result and whether to
/// commit; otherwise the transaction is aborted.
fn write_txn<T>(
    db: &Database,
    op: impl FnOnce(&mut Table<'_, &'static str, &'static [u8]>) -> Result<(T, bool), StorageError>,
) -> Result<T, StorageError> {
    let txn = db.begin_write().map_err(txn_err)?;
    let (out, keep) = {
        let mut table = txn.open_table(KV).map_err(table_err)?;
        op(&mut table)?
    };
    if keep {
        txn.commit().map_err(txn_err)?;
    } else {
        txn.abort().map_err(txn_err)?;
    }
    Ok(out)
}

#[async_trait::async_trait]
impl StorageBackend for RedbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_owned();
        self.run(move |db| {
            let txn = db.begin_read().map_err(txn_err)?;
            let table = txn.open_table(KV).map_err(table_err)?;
            let found = table.get(key.as_str()).map_err(|e| StorageError::Read {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            Ok(found.map(|v| v.value().to_vec()))
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let key = key.to_owned();
        let value = value.to_vec();
        self.run(move |db| {
            write_txn(db, |table| {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(|e| StorageError::Write {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
                Ok(((), true))
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = key.to_owned();
        self.run(move |db| {
            write_txn(db, |table| {
                table.remove(key.as_str()).map_err(|e| StorageError::Delete {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
                Ok(((), true))
            })
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.to_owned();
        self.run(move |db| {
            let txn = db.begin_read().map_err(txn_err)?;
            let table = txn.open_table(KV).map_err(table_err)?;
            let fail = |e: redb::StorageError| StorageError::List {
                prefix: prefix.clone(),
                reason: e.to_string(),
            };

            let mut keys = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(fail)? {
                let (key, _) = entry.map_err(fail)?;
                let key = key.value();
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                keys.push(key.to_owned());
            }
            Ok(keys)
        })
        .await
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
            write_txn(db, |table| {
                let current = table
                    .get(key.as_str())
                    .map_err(|e| StorageError::Read {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?
                    .map(|v| v.value().to_vec());
                if current != expected {
                    return Ok((false, false));
                }
                table
                    .insert(key.as_str(), new.as_slice())
                    .map_err(|e| StorageError::Write {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
                Ok((true, true))
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
    async fn swap_and_list_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strongroom.redb");
        {
            let store = RedbBackend::open(&path).unwrap();
            assert!(store.compare_and_swap("sys/leases/a", None, b"1").await.unwrap());
            assert!(!store.compare_and_swap("sys/leases/a", None, b"2").await.unwrap());
            store.put("sys/leases/b", b"3").await.unwrap();
            store.put("secret/x", b"4").await.unwrap();
        }
        let store = RedbBackend::open(&path).unwrap();
        assert_eq!(
            store.list("sys/leases/").await.unwrap(),
            vec!["sys/leases/a", "sys/leases/b"]
        );
        assert!(store
            .compare_and_swap("sys/leases/a", Some(&b"1"[..]), b"5")
            .await
            .unwrap());
        assert_eq!(store.get("sys/leases/a").await.unwrap().as_deref(), Some(&b"5"[..]));
    }
}
