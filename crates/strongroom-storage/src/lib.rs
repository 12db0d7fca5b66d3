//! Key-value storage for `Strongroom`.
//!
//! [`StorageBackend`] is the only thing the core knows about persistence:
//! string keys, opaque byte values, prefix listing, and a compare-and-swap
//! that every optimistic writer in the core is built on. Values arrive here
//! already encrypted by the barrier; the one exception is the seal
//! configuration, which holds no recoverable key material.
//!
//! | backend | feature | notes |
//! |---|---|---|
//! | [`MemoryBackend`] | always | tests and development |
//! | [`RocksDbBackend`] | `rocksdb-backend` (default) | embedded, single process |
//! | [`RedbBackend`] | `redb-backend` | embedded, pure Rust |
//! | [`PostgresBackend`] | `postgres-backend` | shared SQL table |

mod error;
mod memory;
#[cfg(feature = "postgres-backend")]
mod postgres_backend;
#[cfg(feature = "redb-backend")]
mod redb_backend;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "postgres-backend")]
pub use postgres_backend::PostgresBackend;
#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbBackend;
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

/// Persistent key-value store shared by every core component.
///
/// Keys are `/`-separated UTF-8 paths such as `sys/seal/config` or
/// `sys/leases/<id>`.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// The value at `key`, or `None`.
    ///
    /// # Errors
    ///
    /// [`StorageError::Read`] on backend failure.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Unconditionally set `key` to `value`.
    ///
    /// # Errors
    ///
    /// [`StorageError::Write`] on backend failure.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Absent keys are fine.
    ///
    /// # Errors
    ///
    /// [`StorageError::Delete`] on backend failure.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Every key beginning with `prefix`, sorted ascending.
    ///
    /// # Errors
    ///
    /// [`StorageError::List`] on backend failure.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Write `new` only if the stored value is byte-equal to `expected`
    /// (`None`: only if `key` is absent).
    ///
    /// Check and write are one atomic step with respect to every other
    /// mutation through the same backend. `Ok(false)` means the comparison
    /// failed and nothing was written.
    ///
    /// # Errors
    ///
    /// [`StorageError::Write`] or [`StorageError::Transaction`] on backend
    /// failure.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError>;

    /// Whether `key` is present.
    ///
    /// # Errors
    ///
    /// [`StorageError::Read`] on backend failure.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.get(key).await.map(|v| v.is_some())
    }
}
