//! Versioned secret store with check-and-set writes.
//!
//! Each secret path is one record behind the barrier at `secret/<path>`,
//! holding the metadata and every retained version. Version payloads are
//! additionally encrypted with the secret-data purpose key, so destroying a
//! version only has to drop its ciphertext.
//!
//! Writers never lock. Every mutation is a read-modify-write of the whole
//! record finished with [`Barrier::compare_and_put`] against the ciphertext
//! that was read. A writer that loses the race re-reads and re-applies its
//! change; a check-and-set writer then sees the new `current_version` and
//! fails with [`SecretError::CasConflict`].

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditEvent, AuditManager, EventKind};
use crate::barrier::Barrier;
use crate::encryption::EncryptionService;
use crate::error::{CasExpectation, SecretError};

/// Storage prefix for secret records.
const SECRET_PREFIX: &str = "secret/";

/// Maximum path depth.
const MAX_SEGMENTS: usize = 10;

/// Attempts before a read-modify-write gives up under contention.
const MAX_ATTEMPTS: usize = 8;

/// Tunables for [`SecretStore`].
#[derive(Debug, Clone)]
pub struct SecretStoreOptions {
    /// `max_versions` given to newly created secrets (0 = unlimited).
    pub default_max_versions: u32,
}

impl Default for SecretStoreOptions {
    fn default() -> Self {
        Self {
            default_max_versions: 10,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SecretRecord {
    current_version: u32,
    max_versions: u32,
    cas_required: bool,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    created_by: String,
    updated_at: DateTime<Utc>,
    updated_by: String,
    versions: BTreeMap<u32, VersionRecord>,
}

#[derive(Clone, Serialize, Deserialize)]
struct VersionRecord {
    created_at: DateTime<Utc>,
    created_by: String,
    deleted_at: Option<DateTime<Utc>>,
    destroyed: bool,
    /// Base64 of the payload ciphertext; `None` once destroyed.
    ciphertext: Option<String>,
}

impl SecretRecord {
    fn new(actor: &str, now: DateTime<Utc>, max_versions: u32) -> Self {
        Self {
            current_version: 0,
            max_versions,
            cas_required: false,
            is_deleted: false,
            created_at: now,
            created_by: actor.to_owned(),
            updated_at: now,
            updated_by: actor.to_owned(),
            versions: BTreeMap::new(),
        }
    }

    fn touch(&mut self, actor: &str, now: DateTime<Utc>) {
        self.updated_at = now;
        actor.clone_into(&mut self.updated_by);
    }

    /// Drop the oldest versions beyond `max_versions`, never the current one.
    fn prune(&mut self) -> Vec<u32> {
        let mut pruned = Vec::new();
        if self.max_versions == 0 {
            return pruned;
        }
        let limit = usize::try_from(self.max_versions).unwrap_or(usize::MAX);
        while self.versions.len() > limit {
            match self.versions.keys().next().copied() {
                Some(oldest) if oldest != self.current_version => {
                    self.versions.remove(&oldest);
                    pruned.push(oldest);
                }
                _ => break,
            }
        }
        pruned
    }

    fn version_mut(&mut self, path: &str, version: u32) -> Result<&mut VersionRecord, SecretError> {
        self.versions
            .get_mut(&version)
            .ok_or_else(|| SecretError::VersionNotFound {
                path: path.to_owned(),
                version,
            })
    }

    fn metadata(&self, path: &str) -> SecretMetadata {
        SecretMetadata {
            path: path.to_owned(),
            current_version: self.current_version,
            max_versions: self.max_versions,
            cas_required: self.cas_required,
            is_deleted: self.is_deleted,
            created_at: self.created_at,
            created_by: self.created_by.clone(),
            updated_at: self.updated_at,
            updated_by: self.updated_by.clone(),
            versions: self
                .versions
                .iter()
                .map(|(&version, v)| VersionMetadata {
                    version,
                    created_at: v.created_at,
                    created_by: v.created_by.clone(),
                    deleted_at: v.deleted_at,
                    destroyed: v.destroyed,
                })
                .collect(),
        }
    }
}

/// A decrypted secret version.
#[derive(Clone)]
pub struct SecretVersionData {
    pub path: String,
    pub version: u32,
    pub data: Zeroizing<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl std::fmt::Debug for SecretVersionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVersionData")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("data", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Public view of a secret's settings and version states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub path: String,
    pub current_version: u32,
    /// 0 = unlimited.
    pub max_versions: u32,
    pub cas_required: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    /// Retained versions, oldest first.
    pub versions: Vec<VersionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub destroyed: bool,
}

/// Settings changed by [`SecretStore::update_metadata`]. `None` keeps the
/// current value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetadataUpdate {
    pub max_versions: Option<u32>,
    pub cas_required: Option<bool>,
}

/// Versioned secret CRUD over the barrier.
pub struct SecretStore {
    barrier: Barrier,
    encryption: EncryptionService,
    options: SecretStoreOptions,
    audit: Option<Arc<AuditManager>>,
}

impl SecretStore {
    #[must_use]
    pub fn new(barrier: Barrier, encryption: EncryptionService, options: SecretStoreOptions) -> Self {
        Self {
            barrier,
            encryption,
            options,
            audit: None,
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditManager>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Write a new version and return its number.
    ///
    /// `cas` is the version the caller believes is current (`0`: the secret
    /// must not exist yet). It is checked whenever supplied, and required
    /// when the secret has `cas_required` set.
    ///
    /// # Errors
    ///
    /// - [`SecretError::InvalidPath`] if the path is not acceptable.
    /// - [`SecretError::CasConflict`] if `cas` does not match, or is missing
    ///   on a `cas_required` secret.
    /// - [`SecretError::Barrier`] with `Sealed` if the vault is sealed.
    pub async fn write(
        &self,
        actor: &str,
        path: &str,
        data: &[u8],
        cas: Option<u32>,
    ) -> Result<u32, SecretError> {
        let result = self.write_inner(actor, path, data, cas).await;
        if let Ok(version) = &result {
            info!(path, version, actor, "secret written");
        }
        self.record(EventKind::SecretWritten, actor, path, result.as_ref().err())
            .await;
        result
    }

    async fn write_inner(
        &self,
        actor: &str,
        path: &str,
        data: &[u8],
        cas: Option<u32>,
    ) -> Result<u32, SecretError> {
        let path = normalize_path(path)?;
        let ciphertext = BASE64.encode(self.encryption.encrypt(data).await?);
        let default_max = self.options.default_max_versions;

        self.modify(&path, |record| {
            let now = Utc::now();
            let mut record = record.unwrap_or_else(|| SecretRecord::new(actor, now, default_max));

            let expected = match (cas, record.cas_required) {
                (Some(v), _) => Some(CasExpectation::Version(v)),
                (None, true) => Some(CasExpectation::Missing),
                (None, false) => None,
            };
            let current = CasExpectation::Version(record.current_version);
            if let Some(expected) = expected.filter(|e| *e != current) {
                return Err(SecretError::CasConflict {
                    path: path.clone(),
                    expected,
                    current: record.current_version,
                });
            }

            let version = record.current_version.checked_add(1).ok_or_else(|| {
                SecretError::InvalidRequest {
                    reason: "version counter exhausted".to_owned(),
                }
            })?;
            record.versions.insert(
                version,
                VersionRecord {
                    created_at: now,
                    created_by: actor.to_owned(),
                    deleted_at: None,
                    destroyed: false,
                    ciphertext: Some(ciphertext.clone()),
                },
            );
            record.current_version = version;
            record.is_deleted = false;
            record.touch(actor, now);

            let pruned = record.prune();
            if !pruned.is_empty() {
                debug!(path = %path, ?pruned, "pruned old secret versions");
            }
            Ok((record, version))
        })
        .await
    }

    /// Read a version (default: the latest that is neither deleted nor
    /// destroyed).
    ///
    /// # Errors
    ///
    /// - [`SecretError::NotFound`] if the path does not exist, is
    ///   soft-deleted, or has no readable version.
    /// - [`SecretError::VersionNotFound`] if the version never existed, was
    ///   pruned, or is soft-deleted.
    /// - [`SecretError::VersionDestroyed`] if the version was destroyed.
    /// - [`SecretError::Barrier`] with `Sealed` if the vault is sealed.
    pub async fn read(&self, path: &str, version: Option<u32>) -> Result<SecretVersionData, SecretError> {
        let path = normalize_path(path)?;
        let record = self
            .load(&path)
            .await?
            .filter(|r| !r.is_deleted)
            .ok_or_else(|| SecretError::NotFound { path: path.clone() })?;

        let (number, entry) = match version {
            None => record
                .versions
                .iter()
                .rev()
                .find(|(_, v)| v.deleted_at.is_none() && !v.destroyed)
                .ok_or_else(|| SecretError::NotFound { path: path.clone() })?,
            Some(wanted) => {
                let entry = record.versions.get_key_value(&wanted).ok_or_else(|| {
                    SecretError::VersionNotFound {
                        path: path.clone(),
                        version: wanted,
                    }
                })?;
                if entry.1.destroyed {
                    return Err(SecretError::VersionDestroyed {
                        path,
                        version: wanted,
                    });
                }
                if entry.1.deleted_at.is_some() {
                    return Err(SecretError::VersionNotFound {
                        path,
                        version: wanted,
                    });
                }
                entry
            }
        };

        let encoded = entry.ciphertext.as_deref().ok_or_else(|| SecretError::Corrupted {
            path: path.clone(),
            reason: format!("version {number} has no ciphertext"),
        })?;
        let ciphertext = BASE64.decode(encoded).map_err(|e| SecretError::Corrupted {
            path: path.clone(),
            reason: format!("version {number} ciphertext: {e}"),
        })?;
        let data = Zeroizing::new(self.encryption.decrypt(&ciphertext).await?);

        Ok(SecretVersionData {
            version: *number,
            data,
            created_at: entry.created_at,
            created_by: entry.created_by.clone(),
            path,
        })
    }

    /// Soft-delete versions, or the whole secret when `versions` is empty.
    /// Reversible with [`undelete`](Self::undelete). Destroyed versions are
    /// left as they are.
    ///
    /// # Errors
    ///
    /// - [`SecretError::NotFound`] if the path does not exist.
    /// - [`SecretError::VersionNotFound`] if a listed version is not retained.
    pub async fn soft_delete(&self, actor: &str, path: &str, versions: &[u32]) -> Result<(), SecretError> {
        let result = self.set_deleted(actor, path, versions, true).await;
        self.record(EventKind::SecretDeleted, actor, path, result.as_ref().err())
            .await;
        result
    }

    /// Reverse [`soft_delete`](Self::soft_delete).
    ///
    /// # Errors
    ///
    /// Same as [`soft_delete`](Self::soft_delete).
    pub async fn undelete(&self, actor: &str, path: &str, versions: &[u32]) -> Result<(), SecretError> {
        let result = self.set_deleted(actor, path, versions, false).await;
        self.record(EventKind::SecretUndeleted, actor, path, result.as_ref().err())
            .await;
        result
    }

    async fn set_deleted(
        &self,
        actor: &str,
        path: &str,
        versions: &[u32],
        deleted: bool,
    ) -> Result<(), SecretError> {
        let path = normalize_path(path)?;
        self.modify(&path, |record| {
            let now = Utc::now();
            let mut record = existing(&path, record)?;
            if versions.is_empty() {
                record.is_deleted = deleted;
            }
            for &number in versions {
                let version = record.version_mut(&path, number)?;
                if version.destroyed {
                    continue;
                }
                version.deleted_at = deleted.then_some(now);
            }
            record.touch(actor, now);
            Ok((record, ()))
        })
        .await?;
        info!(path = %path, ?versions, deleted, actor, "secret delete state changed");
        Ok(())
    }

    /// Irreversibly erase the ciphertext of the listed versions.
    ///
    /// # Errors
    ///
    /// - [`SecretError::InvalidRequest`] if `versions` is empty.
    /// - [`SecretError::NotFound`] if the path does not exist.
    /// - [`SecretError::VersionNotFound`] if a listed version is not retained.
    pub async fn destroy(&self, actor: &str, path: &str, versions: &[u32]) -> Result<(), SecretError> {
        let result = self.destroy_inner(actor, path, versions).await;
        self.record(EventKind::SecretDestroyed, actor, path, result.as_ref().err())
            .await;
        result
    }

    async fn destroy_inner(&self, actor: &str, path: &str, versions: &[u32]) -> Result<(), SecretError> {
        if versions.is_empty() {
            return Err(SecretError::InvalidRequest {
                reason: "destroy requires at least one version".to_owned(),
            });
        }
        let path = normalize_path(path)?;
        self.modify(&path, |record| {
            let mut record = existing(&path, record)?;
            for &number in versions {
                let version = record.version_mut(&path, number)?;
                version.destroyed = true;
                version.ciphertext = None;
            }
            record.touch(actor, Utc::now());
            Ok((record, ()))
        })
        .await?;
        info!(path = %path, ?versions, actor, "secret versions destroyed");
        Ok(())
    }

    /// Paths of all secrets starting with `prefix`, sorted. Soft-deleted
    /// secrets are included.
    ///
    /// # Errors
    ///
    /// - [`SecretError::InvalidPath`] if the prefix contains forbidden characters.
    /// - [`SecretError::Barrier`] with `Sealed` if the vault is sealed.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, SecretError> {
        let prefix = prefix.trim_start_matches('/');
        if !prefix.is_empty() {
            check_characters(prefix)?;
        }
        let storage_prefix = format!("{SECRET_PREFIX}{prefix}");
        let keys = self.barrier.list(&storage_prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(SECRET_PREFIX).map(str::to_owned))
            .collect())
    }

    /// Settings and per-version state, including for soft-deleted secrets.
    ///
    /// # Errors
    ///
    /// - [`SecretError::NotFound`] if the path does not exist.
    pub async fn metadata(&self, path: &str) -> Result<SecretMetadata, SecretError> {
        let path = normalize_path(path)?;
        let record = self
            .load(&path)
            .await?
            .ok_or_else(|| SecretError::NotFound { path: path.clone() })?;
        Ok(record.metadata(&path))
    }

    /// Change `max_versions` and/or `cas_required`. Lowering
    /// `max_versions` prunes immediately.
    ///
    /// # Errors
    ///
    /// - [`SecretError::NotFound`] if the path does not exist.
    pub async fn update_metadata(
        &self,
        actor: &str,
        path: &str,
        update: MetadataUpdate,
    ) -> Result<SecretMetadata, SecretError> {
        let result = self.update_metadata_inner(actor, path, update).await;
        self.record(
            EventKind::SecretMetadataUpdated,
            actor,
            path,
            result.as_ref().err(),
        )
        .await;
        result
    }

    async fn update_metadata_inner(
        &self,
        actor: &str,
        path: &str,
        update: MetadataUpdate,
    ) -> Result<SecretMetadata, SecretError> {
        let path = normalize_path(path)?;
        self.modify(&path, |record| {
            let mut record = existing(&path, record)?;
            if let Some(max) = update.max_versions {
                record.max_versions = max;
            }
            if let Some(required) = update.cas_required {
                record.cas_required = required;
            }
            record.prune();
            record.touch(actor, Utc::now());
            let metadata = record.metadata(&path);
            Ok((record, metadata))
        })
        .await
    }

    /// Remove a secret and every version permanently.
    ///
    /// # Errors
    ///
    /// - [`SecretError::NotFound`] if the path does not exist.
    pub async fn purge(&self, actor: &str, path: &str) -> Result<(), SecretError> {
        let result = self.purge_inner(path).await;
        if result.is_ok() {
            info!(path, actor, "secret purged");
        }
        self.record(EventKind::SecretPurged, actor, path, result.as_ref().err())
            .await;
        result
    }

    async fn purge_inner(&self, path: &str) -> Result<(), SecretError> {
        let path = normalize_path(path)?;
        let key = storage_key(&path);
        if !self.barrier.exists(&key).await? {
            return Err(SecretError::NotFound { path });
        }
        self.barrier.delete(&key).await?;
        Ok(())
    }

    /// Whether a secret exists at `path` and is not soft-deleted.
    ///
    /// # Errors
    ///
    /// - [`SecretError::InvalidPath`] if the path is not acceptable.
    /// - [`SecretError::Barrier`] with `Sealed` if the vault is sealed.
    pub async fn is_live(&self, path: &str) -> Result<bool, SecretError> {
        let path = normalize_path(path)?;
        Ok(self.load(&path).await?.is_some_and(|r| !r.is_deleted))
    }

    async fn load(&self, path: &str) -> Result<Option<SecretRecord>, SecretError> {
        match self.barrier.get(&storage_key(path)).await? {
            Some(bytes) => decode(path, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Read-modify-write the record at `path` until the compare-and-put wins.
    async fn modify<T, F>(&self, path: &str, mut apply: F) -> Result<T, SecretError>
    where
        F: FnMut(Option<SecretRecord>) -> Result<(SecretRecord, T), SecretError> + Send,
        T: Send,
    {
        let key = storage_key(path);
        for attempt in 1..=MAX_ATTEMPTS {
            let (record, raw) = match self.barrier.read_for_update(&key).await? {
                Some(snapshot) => (Some(decode(path, &snapshot.value)?), Some(snapshot.raw)),
                None => (None, None),
            };
            let (updated, out) = apply(record)?;
            let bytes = encode(path, &updated)?;
            if self
                .barrier
                .compare_and_put(&key, raw.as_deref(), &bytes)
                .await?
            {
                return Ok(out);
            }
            debug!(path, attempt, "secret record changed concurrently, retrying");
        }
        warn!(path, "giving up on contended secret record");
        Err(SecretError::Contention {
            path: path.to_owned(),
        })
    }

    async fn record(&self, kind: EventKind, actor: &str, path: &str, error: Option<&SecretError>) {
        let Some(audit) = &self.audit else {
            return;
        };
        let event = match error {
            None => AuditEvent::success(kind, actor),
            Some(e) => AuditEvent::failure(kind, actor, e.kind()),
        };
        audit.emit(event.resource(path)).await;
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn storage_key(path: &str) -> String {
    format!("{SECRET_PREFIX}{path}")
}

fn existing(path: &str, record: Option<SecretRecord>) -> Result<SecretRecord, SecretError> {
    record.ok_or_else(|| SecretError::NotFound {
        path: path.to_owned(),
    })
}

fn decode(path: &str, bytes: &[u8]) -> Result<SecretRecord, SecretError> {
    serde_json::from_slice(bytes).map_err(|e| SecretError::Corrupted {
        path: path.to_owned(),
        reason: e.to_string(),
    })
}

fn encode(path: &str, record: &SecretRecord) -> Result<Vec<u8>, SecretError> {
    serde_json::to_vec(record).map_err(|e| SecretError::Corrupted {
        path: path.to_owned(),
        reason: e.to_string(),
    })
}

fn check_characters(path: &str) -> Result<(), SecretError> {
    if path.contains("..") {
        return Err(SecretError::InvalidPath {
            reason: "path traversal (..) is not allowed".to_owned(),
        });
    }
    if !path
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'/')
    {
        return Err(SecretError::InvalidPath {
            reason: "secret path may only contain alphanumeric characters, '_', '-', and '/'"
                .to_owned(),
        });
    }
    Ok(())
}

/// Validate a secret path and strip leading/trailing slashes.
fn normalize_path(path: &str) -> Result<String, SecretError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(SecretError::InvalidPath {
            reason: "secret path must not be empty".to_owned(),
        });
    }
    check_characters(trimmed)?;
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(SecretError::InvalidPath {
            reason: "empty path segment".to_owned(),
        });
    }
    if segments.len() > MAX_SEGMENTS {
        return Err(SecretError::InvalidPath {
            reason: format!("secret path exceeds maximum depth of {MAX_SEGMENTS} segments"),
        });
    }
    Ok(trimmed.to_owned())
}
