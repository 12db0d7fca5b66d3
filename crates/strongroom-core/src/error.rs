//! Error types for `strongroom-core`.
//!
//! Each subsystem has its own error enum carrying enough context to diagnose
//! the problem without a debugger. Every enum also reports an [`ErrorKind`]
//! so callers (and the HTTP layer) can branch on the failure class instead
//! of matching message strings. Errors never include key material,
//! plaintext, or ciphertext.

use std::fmt;

use serde::Serialize;
use strongroom_storage::StorageError;

/// Failure class shared by every error in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AlreadyInitialized,
    NotInitialized,
    InvalidThreshold,
    InvalidShareFormat,
    DuplicateUnsealKey,
    MasterKeyVerificationFailed,
    Sealed,
    CasConflict,
    SecretNotFound,
    VersionDestroyed,
    LeaseNotFound,
    LeaseNotRenewable,
    LeaseRenewalLimitExceeded,
    /// The request itself was malformed (bad path, zero duration, ...).
    InvalidRequest,
    /// Optimistic retries were exhausted by concurrent writers.
    Contention,
    /// The storage backend failed.
    Storage,
    /// Anything else: corrupted records, crypto library failures.
    Internal,
}

impl ErrorKind {
    /// Stable snake-case identifier, used in audit events and API bodies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyInitialized => "already_initialized",
            Self::NotInitialized => "not_initialized",
            Self::InvalidThreshold => "invalid_threshold",
            Self::InvalidShareFormat => "invalid_share_format",
            Self::DuplicateUnsealKey => "duplicate_unseal_key",
            Self::MasterKeyVerificationFailed => "master_key_verification_failed",
            Self::Sealed => "sealed",
            Self::CasConflict => "cas_conflict",
            Self::SecretNotFound => "secret_not_found",
            Self::VersionDestroyed => "version_destroyed",
            Self::LeaseNotFound => "lease_not_found",
            Self::LeaseNotRenewable => "lease_not_renewable",
            Self::LeaseRenewalLimitExceeded => "lease_renewal_limit_exceeded",
            Self::InvalidRequest => "invalid_request",
            Self::Contention => "contention",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the Shamir secret sharing primitive.
#[derive(Debug, thiserror::Error)]
pub enum ShamirError {
    /// Share count or threshold outside `2 <= threshold <= shares <= 255`.
    #[error("invalid threshold: need 2 <= threshold <= shares <= 255, got threshold {threshold} of {shares} shares")]
    InvalidThreshold { shares: u8, threshold: u8 },

    /// The secret to split was empty.
    #[error("cannot split an empty secret")]
    EmptySecret,

    /// Fewer than two shares were supplied to combine.
    #[error("at least 2 shares are required, got {got}")]
    NotEnoughShares { got: usize },

    /// Two shares carry the same x-coordinate.
    #[error("duplicate share x-coordinate {x}")]
    DuplicateShare { x: u8 },

    /// A share is malformed (zero x-coordinate, wrong length, bad encoding).
    #[error("invalid share: {reason}")]
    InvalidShare { reason: String },
}

impl ShamirError {
    /// The failure class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidThreshold { .. } => ErrorKind::InvalidThreshold,
            Self::DuplicateShare { .. } => ErrorKind::DuplicateUnsealKey,
            Self::EmptySecret | Self::NotEnoughShares { .. } | Self::InvalidShare { .. } => {
                ErrorKind::InvalidShareFormat
            }
        }
    }
}

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },
}

/// Errors from seal/unseal operations.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// The vault has already been initialized.
    #[error("vault is already initialized")]
    AlreadyInitialized,

    /// The vault has not been initialized yet.
    #[error("vault is not initialized")]
    NotInitialized,

    /// Share count or threshold out of bounds.
    #[error("invalid seal threshold: {reason}")]
    InvalidThreshold { reason: String },

    /// A submitted unseal key could not be decoded.
    #[error("invalid unseal key format: {reason}")]
    InvalidShareFormat { reason: String },

    /// The same unseal key (or x-coordinate) was already submitted in this attempt.
    #[error("unseal key was already submitted in this attempt")]
    DuplicateUnsealKey,

    /// The reconstructed master key did not match the verification ciphertext.
    /// The unseal attempt has been reset.
    #[error("reconstructed master key failed verification; unseal progress reset")]
    MasterKeyVerificationFailed,

    /// The vault is sealed.
    #[error("vault is sealed")]
    Sealed,

    /// The Shamir primitive rejected its input.
    #[error("seal sharing error: {0}")]
    Shamir(#[from] ShamirError),

    /// A cryptographic operation failed during init.
    #[error("seal crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The persisted seal configuration could not be decoded or encoded.
    #[error("seal configuration corrupted: {reason}")]
    Corrupted { reason: String },

    /// The underlying storage backend returned an error.
    #[error("seal storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SealError {
    /// The failure class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::InvalidThreshold { .. } => ErrorKind::InvalidThreshold,
            Self::InvalidShareFormat { .. } => ErrorKind::InvalidShareFormat,
            Self::DuplicateUnsealKey => ErrorKind::DuplicateUnsealKey,
            Self::MasterKeyVerificationFailed => ErrorKind::MasterKeyVerificationFailed,
            Self::Sealed => ErrorKind::Sealed,
            Self::Shamir(e) => e.kind(),
            Self::Crypto(_) | Self::Corrupted { .. } => ErrorKind::Internal,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// Errors from the encryption service and the encrypted storage barrier.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The vault is sealed; nothing works until it is unsealed.
    #[error("vault is sealed")]
    Sealed,

    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),
}

impl BarrierError {
    /// The failure class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sealed => ErrorKind::Sealed,
            Self::Crypto(_) => ErrorKind::Internal,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// Errors from the versioned secret store.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// No secret exists at the path (or it is soft-deleted).
    #[error("secret not found at path '{path}'")]
    NotFound { path: String },

    /// The requested version does not exist, was pruned, or is soft-deleted.
    #[error("version {version} of secret '{path}' not found")]
    VersionNotFound { path: String, version: u32 },

    /// The requested version was destroyed and can never be read again.
    #[error("version {version} of secret '{path}' was destroyed")]
    VersionDestroyed { path: String, version: u32 },

    /// The check-and-set version did not match the current version.
    #[error("check-and-set conflict on '{path}': expected version {expected}, current is {current}")]
    CasConflict {
        path: String,
        expected: CasExpectation,
        current: u32,
    },

    /// The secret path is not acceptable.
    #[error("invalid secret path: {reason}")]
    InvalidPath { reason: String },

    /// The request parameters are not acceptable.
    #[error("invalid secret request: {reason}")]
    InvalidRequest { reason: String },

    /// Concurrent updates kept winning the compare-and-swap race.
    #[error("secret '{path}' is under contention; retry the operation")]
    Contention { path: String },

    /// A stored record could not be decoded.
    #[error("secret record '{path}' corrupted: {reason}")]
    Corrupted { path: String, reason: String },

    /// The barrier returned an error.
    #[error("secret barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl SecretError {
    /// The failure class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::VersionNotFound { .. } => ErrorKind::SecretNotFound,
            Self::VersionDestroyed { .. } => ErrorKind::VersionDestroyed,
            Self::CasConflict { .. } => ErrorKind::CasConflict,
            Self::InvalidPath { .. } | Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Contention { .. } => ErrorKind::Contention,
            Self::Corrupted { .. } => ErrorKind::Internal,
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// What the caller asserted in a check-and-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasExpectation {
    /// The secret requires CAS but the caller supplied none.
    Missing,
    /// The caller expected this current version.
    Version(u32),
}

impl fmt::Display for CasExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("<none supplied>"),
            Self::Version(v) => write!(f, "{v}"),
        }
    }
}

/// Errors from lease operations.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The lease was not found.
    #[error("lease not found: {lease_id}")]
    NotFound { lease_id: String },

    /// The lease is terminal or already past its expiry.
    #[error("lease {lease_id} is not renewable: {reason}")]
    NotRenewable { lease_id: String, reason: String },

    /// The lease has used all of its renewals.
    #[error("lease {lease_id} reached its renewal limit of {max_renewals}")]
    RenewalLimitExceeded { lease_id: String, max_renewals: u32 },

    /// The request parameters are not acceptable.
    #[error("invalid lease request: {reason}")]
    InvalidRequest { reason: String },

    /// Concurrent updates kept winning the compare-and-swap race.
    #[error("lease {lease_id} is under contention; retry the operation")]
    Contention { lease_id: String },

    /// A stored lease record could not be decoded.
    #[error("lease record '{lease_id}' corrupted: {reason}")]
    Corrupted { lease_id: String, reason: String },

    /// The credential-rotation collaborator failed to invalidate a credential.
    #[error("credential revocation for lease {lease_id} failed: {reason}")]
    Revocation { lease_id: String, reason: String },

    /// The bound secret could not be resolved.
    #[error("lease secret error: {0}")]
    Secret(#[from] SecretError),

    /// The barrier returned an error.
    #[error("lease barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl LeaseError {
    /// The failure class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::LeaseNotFound,
            Self::NotRenewable { .. } => ErrorKind::LeaseNotRenewable,
            Self::RenewalLimitExceeded { .. } => ErrorKind::LeaseRenewalLimitExceeded,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Contention { .. } => ErrorKind::Contention,
            Self::Corrupted { .. } | Self::Revocation { .. } => ErrorKind::Internal,
            Self::Secret(e) => e.kind(),
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from audit event sinks.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// A specific audit backend failed.
    #[error("audit backend '{name}' failed: {reason}")]
    BackendFailure { name: String, reason: String },

    /// Serialization of the audit event failed.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_maps_to_sealed_kind_from_every_component() {
        assert_eq!(SealError::Sealed.kind(), ErrorKind::Sealed);
        assert_eq!(BarrierError::Sealed.kind(), ErrorKind::Sealed);
        assert_eq!(
            SecretError::Barrier(BarrierError::Sealed).kind(),
            ErrorKind::Sealed
        );
        assert_eq!(
            LeaseError::Barrier(BarrierError::Sealed).kind(),
            ErrorKind::Sealed
        );
        assert_eq!(
            LeaseError::Secret(SecretError::Barrier(BarrierError::Sealed)).kind(),
            ErrorKind::Sealed
        );
    }

    #[test]
    fn pruned_and_missing_versions_share_not_found_kind() {
        let missing = SecretError::NotFound {
            path: "db/creds".to_owned(),
        };
        let pruned = SecretError::VersionNotFound {
            path: "db/creds".to_owned(),
            version: 1,
        };
        assert_eq!(missing.kind(), ErrorKind::SecretNotFound);
        assert_eq!(pruned.kind(), ErrorKind::SecretNotFound);
    }

    #[test]
    fn cas_conflict_message_names_versions() {
        let err = SecretError::CasConflict {
            path: "db/creds".to_owned(),
            expected: CasExpectation::Version(1),
            current: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected version 1"));
        assert!(msg.contains("current is 2"));
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::LeaseRenewalLimitExceeded).unwrap_or_default();
        assert_eq!(json, "\"lease_renewal_limit_exceeded\"");
        assert_eq!(ErrorKind::CasConflict.to_string(), "cas_conflict");
    }
}
