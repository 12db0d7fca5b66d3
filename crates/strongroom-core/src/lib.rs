//! Core library for `Strongroom`.
//!
//! Contains the Shamir secret sharing arithmetic, the seal/unseal lifecycle,
//! the AES-256-GCM encryption barrier, the versioned secret store with
//! check-and-set writes, the lease manager and its background sweeper, and
//! the audit trail. Storage is reached only through the `StorageBackend`
//! trait from `strongroom-storage`; HTTP lives in `strongroom-server`.

pub mod audit;
pub mod audit_file;
pub mod barrier;
pub mod clock;
pub mod crypto;
pub mod encryption;
pub mod error;
pub mod lease;
pub mod seal;
pub mod secret;
pub mod shamir;
pub mod sweeper;

pub use audit::{AuditBackend, AuditEvent, AuditManager, EventKind, MemoryAuditBackend, Outcome};
pub use audit_file::FileAuditBackend;
pub use barrier::Barrier;
pub use clock::{Clock, ManualClock, SystemClock};
pub use encryption::EncryptionService;
pub use error::ErrorKind;
pub use lease::{
    CredentialRevoker, Lease, LeaseManager, LeaseManagerOptions, LeaseRequest, LeaseStatus,
    NoopRevoker, RevocationCause, SweepReport,
};
pub use seal::{InitResult, SealManager, SealStatus};
pub use secret::{
    MetadataUpdate, SecretMetadata, SecretStore, SecretStoreOptions, SecretVersionData,
    VersionMetadata,
};
pub use sweeper::LeaseSweeper;
