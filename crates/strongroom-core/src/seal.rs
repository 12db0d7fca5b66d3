//! Seal/unseal lifecycle for `Strongroom`.
//!
//! The vault moves through `Uninitialized → Unsealed → Sealed → (collecting
//! unseal keys) → Unsealed`:
//!
//! 1. **Initialize**: generate a 256-bit master key, split it into N Shamir
//!    shares with threshold K, persist the seal configuration together with a
//!    verification ciphertext, keep the master key in memory. The unseal keys
//!    and root token are returned once and never stored.
//!
//! 2. **Unseal**: operators submit keys one at a time. At K keys the shares
//!    are combined and the candidate key is checked against the verification
//!    ciphertext. Any failure resets the attempt to zero.
//!
//! 3. **Seal**: zeroize the master key and drop any in-progress attempt.
//!
//! # Security model
//!
//! - The master key and the pending shares live behind one `tokio` mutex
//!   owned by the [`SealManager`]. Every read or change of seal state takes it.
//! - The verification ciphertext is the master key encrypted under a key
//!   derived from itself, so only the correct key can open it.
//! - Only a SHA-256 digest of the root token is persisted.
//! - The seal configuration is stored outside the barrier (it must be
//!   readable while sealed) and contains no recoverable key material.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strongroom_storage::StorageBackend;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::audit::{AuditEvent, AuditManager, EventKind};
use crate::crypto::{self, EncryptionKey, KEY_LEN};
use crate::encryption::KeyPurpose;
use crate::error::{BarrierError, SealError};
use crate::shamir::{self, Share};

/// Storage key for the seal configuration.
const SEAL_CONFIG_PATH: &str = "sys/seal/config";

/// Persisted seal configuration.
#[derive(Clone, Serialize, Deserialize)]
struct SealConfiguration {
    initialized: bool,
    secret_shares: u8,
    secret_threshold: u8,
    /// Base64 of the verification ciphertext.
    encrypted_master_key: String,
    /// Hex SHA-256 of the root token.
    root_token_hash: String,
    initialized_at: DateTime<Utc>,
    last_sealed_at: Option<DateTime<Utc>>,
    last_unsealed_at: Option<DateTime<Utc>>,
}

/// Everything guarded by the seal lock.
#[derive(Default)]
struct SealState {
    master_key: Option<EncryptionKey>,
    pending: Vec<Share>,
}

impl SealState {
    fn progress(&self) -> u8 {
        u8::try_from(self.pending.len()).unwrap_or(u8::MAX)
    }
}

/// Result of a successful initialization. Shown once.
pub struct InitResult {
    /// Unseal keys, standard base64 of `x || y`.
    pub unseal_keys: Vec<String>,
    /// The same keys hex-encoded.
    pub unseal_keys_hex: Vec<String>,
    /// Root token for the external auth layer to bootstrap with.
    pub root_token: String,
}

impl std::fmt::Debug for InitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitResult")
            .field("unseal_keys", &format_args!("[{} REDACTED]", self.unseal_keys.len()))
            .field("root_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Current seal status of the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    pub initialized: bool,
    pub sealed: bool,
    /// Keys required to unseal (0 when uninitialized).
    pub threshold: u8,
    /// Keys issued at initialization (0 when uninitialized).
    pub shares: u8,
    /// Keys accepted so far in the current unseal attempt.
    pub progress: u8,
    pub initialized_at: Option<DateTime<Utc>>,
    pub last_sealed_at: Option<DateTime<Utc>>,
    pub last_unsealed_at: Option<DateTime<Utc>>,
}

impl SealStatus {
    fn uninitialized() -> Self {
        Self {
            initialized: false,
            sealed: true,
            threshold: 0,
            shares: 0,
            progress: 0,
            initialized_at: None,
            last_sealed_at: None,
            last_unsealed_at: None,
        }
    }

    fn from_config(config: &SealConfiguration, state: &SealState) -> Self {
        Self {
            initialized: config.initialized,
            sealed: state.master_key.is_none(),
            threshold: config.secret_threshold,
            shares: config.secret_shares,
            progress: state.progress(),
            initialized_at: Some(config.initialized_at),
            last_sealed_at: config.last_sealed_at,
            last_unsealed_at: config.last_unsealed_at,
        }
    }
}

/// Owns the master key and the seal state machine.
pub struct SealManager {
    storage: Arc<dyn StorageBackend>,
    state: Mutex<SealState>,
    audit: Option<Arc<AuditManager>>,
}

impl SealManager {
    /// Create a sealed manager over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            state: Mutex::new(SealState::default()),
            audit: None,
        }
    }

    /// Emit seal lifecycle events to `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditManager>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Initialize a new vault and leave it unsealed.
    ///
    /// # Errors
    ///
    /// - [`SealError::AlreadyInitialized`] if a configuration exists. This
    ///   is checked before the share parameters.
    /// - [`SealError::InvalidThreshold`] unless `2 <= threshold <= shares`.
    /// - [`SealError::Crypto`] or [`SealError::Storage`] on internal failure.
    pub async fn initialize(
        &self,
        actor: &str,
        shares: u8,
        threshold: u8,
    ) -> Result<InitResult, SealError> {
        let result = self.initialize_locked(shares, threshold).await;
        match &result {
            Ok(_) => info!(shares, threshold, actor, "vault initialized"),
            Err(e) => warn!(error = %e, actor, "vault initialization failed"),
        }
        self.record(EventKind::VaultInitialized, actor, result.as_ref().err())
            .await;
        result
    }

    async fn initialize_locked(&self, shares: u8, threshold: u8) -> Result<InitResult, SealError> {
        let mut state = self.state.lock().await;
        if self.storage.exists(SEAL_CONFIG_PATH).await? {
            return Err(SealError::AlreadyInitialized);
        }
        shamir::validate(shares, threshold).map_err(|e| SealError::InvalidThreshold {
            reason: e.to_string(),
        })?;

        let master_key = EncryptionKey::generate();
        let key_shares = shamir::split(master_key.as_bytes(), shares, threshold)?;

        let verification_key = crypto::derive_key(&master_key, None, KeyPurpose::Verification.info())?;
        let verification = crypto::encrypt(&verification_key, master_key.as_bytes())?;

        let root_token = uuid::Uuid::new_v4().to_string();

        let config = SealConfiguration {
            initialized: true,
            secret_shares: shares,
            secret_threshold: threshold,
            encrypted_master_key: BASE64.encode(&verification),
            root_token_hash: crypto::sha256_hex(root_token.as_bytes()),
            initialized_at: Utc::now(),
            last_sealed_at: None,
            last_unsealed_at: None,
        };
        // Absent-only write: a concurrent initializer on shared storage loses.
        if !self
            .storage
            .compare_and_swap(SEAL_CONFIG_PATH, None, &encode_config(&config)?)
            .await?
        {
            return Err(SealError::AlreadyInitialized);
        }

        state.pending.clear();
        state.master_key = Some(master_key);

        let encoded: Vec<_> = key_shares.iter().map(Share::to_bytes).collect();
        Ok(InitResult {
            unseal_keys: encoded.iter().map(|b| BASE64.encode(b.as_slice())).collect(),
            unseal_keys_hex: encoded.iter().map(|b| hex::encode(b.as_slice())).collect(),
            root_token,
        })
    }

    /// Submit one unseal key (base64 or hex).
    ///
    /// Returns the status after the submission. A no-op when already unsealed.
    ///
    /// # Errors
    ///
    /// - [`SealError::InvalidShareFormat`] if the key cannot be decoded.
    /// - [`SealError::NotInitialized`] if the vault was never initialized.
    /// - [`SealError::DuplicateUnsealKey`] if a key with the same
    ///   x-coordinate was already accepted in this attempt. Progress is kept.
    /// - [`SealError::MasterKeyVerificationFailed`] if the combined key is
    ///   wrong. Progress is reset to zero.
    pub async fn unseal(&self, actor: &str, key: &str) -> Result<SealStatus, SealError> {
        match self.unseal_locked(key).await {
            Ok((status, unsealed)) => {
                if unsealed {
                    info!(actor, "vault unsealed");
                    self.record(EventKind::VaultUnsealed, actor, None).await;
                }
                Ok(status)
            }
            Err(e) => {
                warn!(error = %e, actor, "unseal attempt rejected");
                self.record(EventKind::VaultUnsealed, actor, Some(&e)).await;
                Err(e)
            }
        }
    }

    /// Returns the status and whether this call performed the unseal.
    async fn unseal_locked(&self, key: &str) -> Result<(SealStatus, bool), SealError> {
        let share = decode_unseal_key(key)?;

        let mut state = self.state.lock().await;
        let Some(mut config) = self.load_config().await? else {
            return Err(SealError::NotInitialized);
        };
        if state.master_key.is_some() {
            return Ok((SealStatus::from_config(&config, &state), false));
        }

        if state.pending.iter().any(|p| p.x() == share.x()) {
            return Err(SealError::DuplicateUnsealKey);
        }
        state.pending.push(share);

        if state.pending.len() < usize::from(config.secret_threshold) {
            return Ok((SealStatus::from_config(&config, &state), false));
        }

        // Threshold reached: whatever happens next, this attempt is over.
        let pending = std::mem::take(&mut state.pending);
        let candidate = verify_candidate(&config, &pending)?;

        config.last_unsealed_at = Some(Utc::now());
        self.storage
            .put(SEAL_CONFIG_PATH, &encode_config(&config)?)
            .await?;
        state.master_key = Some(candidate);

        Ok((SealStatus::from_config(&config, &state), true))
    }

    /// Seal the vault: zeroize the master key and drop pending unseal keys.
    ///
    /// Sealing an already sealed vault only clears pending keys.
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInitialized`] if the vault was never initialized.
    /// - [`SealError::Storage`] if the configuration cannot be read.
    pub async fn seal(&self, actor: &str) -> Result<SealStatus, SealError> {
        let mut state = self.state.lock().await;
        let Some(mut config) = self.load_config().await? else {
            return Err(SealError::NotInitialized);
        };
        state.pending.clear();

        let Some(mut key) = state.master_key.take() else {
            return Ok(SealStatus::from_config(&config, &state));
        };
        key.zeroize();
        drop(key);

        config.last_sealed_at = Some(Utc::now());
        // The key is already gone; a failed timestamp write does not unseal.
        match encode_config(&config) {
            Ok(bytes) => {
                if let Err(e) = self.storage.put(SEAL_CONFIG_PATH, &bytes).await {
                    warn!(error = %e, "failed to persist seal timestamp");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode seal configuration"),
        }
        let status = SealStatus::from_config(&config, &state);
        drop(state);

        info!(actor, "vault sealed");
        self.record(EventKind::VaultSealed, actor, None).await;
        Ok(status)
    }

    /// Current seal status.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Storage`] or [`SealError::Corrupted`] if the
    /// configuration cannot be loaded.
    pub async fn status(&self) -> Result<SealStatus, SealError> {
        let state = self.state.lock().await;
        Ok(match self.load_config().await? {
            Some(config) => SealStatus::from_config(&config, &state),
            None => SealStatus::uninitialized(),
        })
    }

    /// Whether no master key is currently held.
    pub async fn is_sealed(&self) -> bool {
        self.state.lock().await.master_key.is_none()
    }

    /// Check `candidate` against the stored root token digest in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::NotInitialized`] if the vault was never initialized.
    pub async fn verify_root_token(&self, candidate: &str) -> Result<bool, SealError> {
        let Some(config) = self.load_config().await? else {
            return Err(SealError::NotInitialized);
        };
        let digest = crypto::sha256_hex(candidate.as_bytes());
        Ok(digest
            .as_bytes()
            .ct_eq(config.root_token_hash.as_bytes())
            .into())
    }

    /// Derive the key for `purpose` from the master key.
    pub(crate) async fn derive_purpose_key(
        &self,
        purpose: KeyPurpose,
    ) -> Result<EncryptionKey, BarrierError> {
        let state = self.state.lock().await;
        let master = state.master_key.as_ref().ok_or(BarrierError::Sealed)?;
        Ok(crypto::derive_key(master, None, purpose.info())?)
    }

    async fn load_config(&self) -> Result<Option<SealConfiguration>, SealError> {
        let Some(bytes) = self.storage.get(SEAL_CONFIG_PATH).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SealError::Corrupted {
                reason: e.to_string(),
            })
    }

    async fn record(&self, kind: EventKind, actor: &str, error: Option<&SealError>) {
        let Some(audit) = &self.audit else {
            return;
        };
        let event = match error {
            None => AuditEvent::success(kind, actor),
            Some(e) => AuditEvent::failure(kind, actor, e.kind()),
        };
        audit.emit(event).await;
    }
}

impl std::fmt::Debug for SealManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealManager").finish_non_exhaustive()
    }
}

fn encode_config(config: &SealConfiguration) -> Result<Vec<u8>, SealError> {
    serde_json::to_vec(config).map_err(|e| SealError::Corrupted {
        reason: e.to_string(),
    })
}

/// Decode an unseal key from hex or standard base64 into a share.
fn decode_unseal_key(key: &str) -> Result<Share, SealError> {
    let key = key.trim();
    let looks_hex = key.len() == 2 * (KEY_LEN + 1) && key.bytes().all(|b| b.is_ascii_hexdigit());
    let bytes = if looks_hex {
        hex::decode(key).map_err(|e| SealError::InvalidShareFormat {
            reason: format!("hex decode failed: {e}"),
        })?
    } else {
        BASE64.decode(key).map_err(|e| SealError::InvalidShareFormat {
            reason: format!("base64 decode failed: {e}"),
        })?
    };

    let share = Share::from_bytes(&bytes).map_err(|e| SealError::InvalidShareFormat {
        reason: e.to_string(),
    })?;
    if share.secret_len() != KEY_LEN {
        return Err(SealError::InvalidShareFormat {
            reason: format!("expected {} bytes, got {}", KEY_LEN + 1, bytes.len()),
        });
    }
    Ok(share)
}

/// Combine `shares` and check the result against the verification blob.
fn verify_candidate(
    config: &SealConfiguration,
    shares: &[Share],
) -> Result<EncryptionKey, SealError> {
    let combined = shamir::combine(shares)?;
    let candidate =
        EncryptionKey::from_slice(&combined).ok_or(SealError::MasterKeyVerificationFailed)?;

    let verification = BASE64
        .decode(&config.encrypted_master_key)
        .map_err(|e| SealError::Corrupted {
            reason: format!("verification ciphertext: {e}"),
        })?;
    let verification_key = crypto::derive_key(&candidate, None, KeyPurpose::Verification.info())?;
    let Ok(mut opened) = crypto::decrypt(&verification_key, &verification) else {
        return Err(SealError::MasterKeyVerificationFailed);
    };
    let matches = candidate.ct_eq_bytes(&opened);
    opened.zeroize();

    if matches {
        Ok(candidate)
    } else {
        Err(SealError::MasterKeyVerificationFailed)
    }
}
