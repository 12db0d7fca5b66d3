//! Symmetric primitives: AES-256-GCM, HKDF-SHA256, SHA-256 and the OS RNG.
//!
//! Sealed blobs are laid out as `nonce[12] || ciphertext || tag[16]`. The
//! nonce is drawn fresh from the OS RNG for every call, so encrypting the
//! same plaintext twice never yields the same bytes.

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// AES-256 key length.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// 32 bytes of key material, wiped on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// `None` unless `bytes` is exactly [`KEY_LEN`] long.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; KEY_LEN]>::try_from(bytes).ok().map(Self)
    }

    /// A fresh key from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = Self([0; KEY_LEN]);
        fill_random(&mut key.0);
        key
    }

    /// Raw key bytes. Never log or persist them.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Constant-time comparison with `other`. A length mismatch is unequal.
    #[must_use]
    pub fn ct_eq_bytes(&self, other: &[u8]) -> bool {
        bool::from(self.0[..].ct_eq(other))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Fill `buf` with bytes from the OS RNG.
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Seal `plaintext` under `key`.
///
/// # Errors
///
/// [`CryptoError::Encryption`] if the AEAD rejects the input.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce);

    let body = key
        .cipher()
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut sealed = nonce.to_vec();
    sealed.extend(body);
    Ok(sealed)
}

/// Open a blob produced by [`encrypt`].
///
/// # Errors
///
/// - [`CryptoError::CiphertextTooShort`] if the blob cannot even hold a
///   nonce and a tag.
/// - [`CryptoError::Decryption`] for a wrong key or any modified byte.
pub fn decrypt(key: &EncryptionKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let min = NONCE_LEN + TAG_LEN;
    let Some((nonce, body)) = sealed
        .split_first_chunk::<NONCE_LEN>()
        .filter(|(_, body)| body.len() >= TAG_LEN)
    else {
        return Err(CryptoError::CiphertextTooShort {
            expected: min,
            actual: sealed.len(),
        });
    };

    key.cipher()
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

/// HKDF-SHA256 expansion of `root_key` into a 32-byte subkey. Distinct
/// `info` labels give independent keys.
///
/// # Errors
///
/// [`CryptoError::KeyDerivation`] if HKDF refuses the output length.
pub fn derive_key(
    root_key: &EncryptionKey,
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    Hkdf::<Sha256>::new(salt, root_key.as_bytes())
        .expand(info, &mut okm[..])
        .map_err(|e| CryptoError::KeyDerivation {
            context: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(*okm))
}
