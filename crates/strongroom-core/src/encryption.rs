//! Authenticated encryption keyed by the in-memory master key.
//!
//! The master key is never used directly. Each use-case gets its own
//! AES-256-GCM key derived with HKDF-SHA256 under a distinct `info` label
//! ([`KeyPurpose`]). Derivation happens under the seal manager's lock, so an
//! operation racing a seal either sees the key or fails with
//! [`BarrierError::Sealed`]; it never sees a half-cleared key.

use std::sync::Arc;

use crate::crypto;
use crate::error::BarrierError;
use crate::seal::SealManager;

/// The use-case a derived key is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    /// Encrypts every record the barrier writes to storage.
    Barrier,
    /// Encrypts secret version payloads inside their records.
    SecretData,
    /// Encrypts the seal verification blob.
    Verification,
}

impl KeyPurpose {
    /// HKDF `info` label for this purpose.
    #[must_use]
    pub fn info(self) -> &'static [u8] {
        match self {
            Self::Barrier => b"strongroom-barrier-v1",
            Self::SecretData => b"strongroom-secret-data-v1",
            Self::Verification => b"strongroom-verification-v1",
        }
    }
}

/// Symmetric encryption available only while the vault is unsealed.
#[derive(Debug, Clone)]
pub struct EncryptionService {
    seal: Arc<SealManager>,
}

impl EncryptionService {
    #[must_use]
    pub fn new(seal: Arc<SealManager>) -> Self {
        Self { seal }
    }

    /// Encrypt application data (`nonce || ciphertext || tag`).
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if no master key is held.
    /// - [`BarrierError::Crypto`] if the AEAD operation fails.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, BarrierError> {
        self.encrypt_for(KeyPurpose::SecretData, plaintext).await
    }

    /// Decrypt data produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if no master key is held.
    /// - [`BarrierError::Crypto`] if authentication fails.
    pub async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, BarrierError> {
        self.decrypt_for(KeyPurpose::SecretData, ciphertext).await
    }

    /// Whether the vault is currently sealed.
    pub async fn is_sealed(&self) -> bool {
        self.seal.is_sealed().await
    }

    pub(crate) async fn encrypt_for(
        &self,
        purpose: KeyPurpose,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, BarrierError> {
        let key = self.seal.derive_purpose_key(purpose).await?;
        Ok(crypto::encrypt(&key, plaintext)?)
    }

    pub(crate) async fn decrypt_for(
        &self,
        purpose: KeyPurpose,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, BarrierError> {
        let key = self.seal.derive_purpose_key(purpose).await?;
        Ok(crypto::decrypt(&key, ciphertext)?)
    }
}
