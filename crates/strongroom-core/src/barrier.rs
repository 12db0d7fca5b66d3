//! Encrypted view over a storage backend.
//!
//! Every value that passes through the barrier is encrypted with the barrier
//! purpose key before it reaches storage. Keys (paths) stay in plaintext so
//! prefix listing works. While the vault is sealed every operation, including
//! the ones that never decrypt, fails with [`BarrierError::Sealed`].
//!
//! Optimistic writers use [`Barrier::read_for_update`] to get both the
//! plaintext and the exact stored ciphertext, then [`Barrier::compare_and_put`]
//! to write only if that ciphertext is still what storage holds. Fresh nonces
//! make every write's ciphertext unique, so the ciphertext doubles as a
//! version stamp.

use std::sync::Arc;

use strongroom_storage::StorageBackend;

use crate::encryption::{EncryptionService, KeyPurpose};
use crate::error::BarrierError;

/// A decrypted value together with the ciphertext it was read from.
#[derive(Clone)]
pub struct Snapshot {
    pub value: Vec<u8>,
    /// Stored bytes, passed back to [`Barrier::compare_and_put`].
    pub raw: Vec<u8>,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("value", &"[REDACTED]")
            .field("raw_len", &self.raw.len())
            .finish()
    }
}

/// The encryption barrier wrapping a storage backend.
#[derive(Clone)]
pub struct Barrier {
    storage: Arc<dyn StorageBackend>,
    encryption: EncryptionService,
}

impl Barrier {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, encryption: EncryptionService) -> Self {
        Self {
            storage,
            encryption,
        }
    }

    /// Read and decrypt a value. `Ok(None)` if the key is absent.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Crypto`] if decryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        Ok(self.read_for_update(key).await?.map(|s| s.value))
    }

    /// Encrypt and write a value, overwriting whatever is there.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Crypto`] if encryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        let ciphertext = self.encryption.encrypt_for(KeyPurpose::Barrier, value).await?;
        self.storage.put(key, &ciphertext).await?;
        Ok(())
    }

    /// Delete a key. Deleting an absent key is not an error.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        self.ensure_unsealed().await?;
        self.storage.delete(key).await?;
        Ok(())
    }

    /// List keys under `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        self.ensure_unsealed().await?;
        Ok(self.storage.list(prefix).await?)
    }

    /// Whether a key exists.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn exists(&self, key: &str) -> Result<bool, BarrierError> {
        self.ensure_unsealed().await?;
        Ok(self.storage.exists(key).await?)
    }

    /// Read a value along with its stored ciphertext.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub async fn read_for_update(&self, key: &str) -> Result<Option<Snapshot>, BarrierError> {
        self.ensure_unsealed().await?;
        let Some(raw) = self.storage.get(key).await? else {
            return Ok(None);
        };
        let value = self.encryption.decrypt_for(KeyPurpose::Barrier, &raw).await?;
        Ok(Some(Snapshot { value, raw }))
    }

    /// Encrypt `value` and write it only if storage still holds
    /// `expected_raw` (`None`: only if absent).
    ///
    /// Returns `Ok(false)` when another writer got there first.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put).
    pub async fn compare_and_put(
        &self,
        key: &str,
        expected_raw: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool, BarrierError> {
        let ciphertext = self.encryption.encrypt_for(KeyPurpose::Barrier, value).await?;
        Ok(self
            .storage
            .compare_and_swap(key, expected_raw, &ciphertext)
            .await?)
    }

    async fn ensure_unsealed(&self) -> Result<(), BarrierError> {
        if self.encryption.is_sealed().await {
            return Err(BarrierError::Sealed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier").finish_non_exhaustive()
    }
}
