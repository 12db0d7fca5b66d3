//! Time-bounded leases on secrets.
//!
//! Leases are stored through the barrier at `sys/leases/<id>`, renewal
//! history included. Status moves one way: `Active` to `Expired` or
//! `Revoked`, with renewal as the only `Active → Active` step.
//!
//! Every status change is a compare-and-put against the record that was
//! read, so an API renewal and a sweeper expiry racing on the same lease
//! cannot both succeed: the loser re-reads, sees the terminal status, and
//! reports it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditManager, EventKind};
use crate::barrier::Barrier;
use crate::clock::Clock;
use crate::error::{LeaseError, SecretError};
use crate::secret::SecretStore;

/// Storage prefix for lease records.
const LEASE_PREFIX: &str = "sys/leases/";

/// Attempts before a contended lease update gives up.
const MAX_ATTEMPTS: usize = 8;

/// Actor recorded for sweeper-driven transitions.
pub const SWEEPER_ACTOR: &str = "system:lease-sweeper";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Active,
    Expired,
    Revoked,
}

/// One entry of a lease's renewal history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalRecord {
    pub renewed_at: DateTime<Utc>,
    pub increment_secs: u64,
    pub previous_expires_at: DateTime<Utc>,
    pub new_expires_at: DateTime<Utc>,
    /// Performed by the sweeper rather than a caller.
    pub automatic: bool,
    pub actor: String,
}

/// A time-bounded grant on a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub secret_path: String,
    pub requester: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Original duration; also the default renewal increment.
    pub duration_secs: u64,
    pub renewal_count: u32,
    pub max_renewals: u32,
    pub auto_renewal_enabled: bool,
    pub status: LeaseStatus,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    pub expired_at: Option<DateTime<Utc>>,
    pub renewals: Vec<RenewalRecord>,
}

impl Lease {
    /// Whether the lease is `Active` and not yet past `expires_at`.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.status == LeaseStatus::Active && now <= self.expires_at
    }

    fn extend(
        &mut self,
        now: DateTime<Utc>,
        increment_secs: u64,
        automatic: bool,
        actor: &str,
    ) -> Result<(), LeaseError> {
        let previous = self.expires_at;
        // An overdue lease is extended from now so it comes back live.
        let new_expires_at = seconds(increment_secs)
            .and_then(|d| previous.max(now).checked_add_signed(d))
            .ok_or_else(|| LeaseError::InvalidRequest {
                reason: format!("increment of {increment_secs}s is out of range"),
            })?;
        self.expires_at = new_expires_at;
        self.renewal_count = self.renewal_count.saturating_add(1);
        self.renewals.push(RenewalRecord {
            renewed_at: now,
            increment_secs,
            previous_expires_at: previous,
            new_expires_at,
            automatic,
            actor: actor.to_owned(),
        });
        Ok(())
    }
}

/// Parameters for [`LeaseManager::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub secret_path: String,
    pub requester: String,
    pub duration_secs: u64,
    #[serde(default)]
    pub max_renewals: u32,
    #[serde(default)]
    pub auto_renewal_enabled: bool,
}

/// Tunables for [`LeaseManager`].
#[derive(Debug, Clone)]
pub struct LeaseManagerOptions {
    /// The sweeper auto-renews eligible leases this close to expiry.
    pub auto_renew_threshold: Duration,
}

impl Default for LeaseManagerOptions {
    fn default() -> Self {
        Self {
            auto_renew_threshold: Duration::seconds(300),
        }
    }
}

/// Counts from one sweep tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub auto_renewed: usize,
    pub failed: usize,
}

/// Why a credential is being invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationCause {
    Expired,
    Revoked,
}

/// Credential-rotation collaborator, told when a lease ends so it can
/// invalidate the credential at the target system.
#[async_trait::async_trait]
pub trait CredentialRevoker: Send + Sync {
    /// Invalidate whatever `lease` granted.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Revocation`] if the target system refused.
    async fn invalidate(&self, lease: &Lease, cause: RevocationCause) -> Result<(), LeaseError>;
}

/// A revoker with nothing to invalidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRevoker;

#[async_trait::async_trait]
impl CredentialRevoker for NoopRevoker {
    async fn invalidate(&self, _lease: &Lease, _cause: RevocationCause) -> Result<(), LeaseError> {
        Ok(())
    }
}

enum SweepOutcome {
    Untouched,
    Expired,
    AutoRenewed,
}

/// Issues, renews, revokes, and expires leases.
pub struct LeaseManager {
    barrier: Barrier,
    secrets: Arc<SecretStore>,
    clock: Arc<dyn Clock>,
    revoker: Arc<dyn CredentialRevoker>,
    options: LeaseManagerOptions,
    audit: Option<Arc<AuditManager>>,
}

impl LeaseManager {
    #[must_use]
    pub fn new(
        barrier: Barrier,
        secrets: Arc<SecretStore>,
        clock: Arc<dyn Clock>,
        options: LeaseManagerOptions,
    ) -> Self {
        Self {
            barrier,
            secrets,
            clock,
            revoker: Arc::new(NoopRevoker),
            options,
            audit: None,
        }
    }

    #[must_use]
    pub fn with_revoker(mut self, revoker: Arc<dyn CredentialRevoker>) -> Self {
        self.revoker = revoker;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditManager>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Issue an `Active` lease expiring `duration_secs` from now.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::InvalidRequest`] if the duration is zero or too large.
    /// - [`LeaseError::Secret`] with `NotFound` if the secret does not exist
    ///   or is soft-deleted.
    /// - `Sealed` (through [`LeaseError::Secret`]) if the vault is sealed.
    pub async fn create(&self, actor: &str, request: &LeaseRequest) -> Result<Lease, LeaseError> {
        let result = self.create_inner(request).await;
        match &result {
            Ok(lease) => {
                info!(
                    lease_id = %lease.id,
                    secret = %lease.secret_path,
                    duration_secs = lease.duration_secs,
                    actor,
                    "lease issued"
                );
                self.record(EventKind::LeaseIssued, actor, &lease.id, None).await;
            }
            Err(e) => {
                self.record(EventKind::LeaseIssued, actor, &request.secret_path, Some(e))
                    .await;
            }
        }
        result
    }

    async fn create_inner(&self, request: &LeaseRequest) -> Result<Lease, LeaseError> {
        if request.duration_secs == 0 {
            return Err(LeaseError::InvalidRequest {
                reason: "lease duration must be positive".to_owned(),
            });
        }
        let now = self.clock.now();
        let expires_at = seconds(request.duration_secs)
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| LeaseError::InvalidRequest {
                reason: format!("duration of {}s is out of range", request.duration_secs),
            })?;

        if !self.secrets.is_live(&request.secret_path).await? {
            return Err(SecretError::NotFound {
                path: request.secret_path.clone(),
            }
            .into());
        }

        let lease = Lease {
            id: uuid::Uuid::new_v4().to_string(),
            secret_path: request.secret_path.trim_matches('/').to_owned(),
            requester: request.requester.clone(),
            issued_at: now,
            expires_at,
            duration_secs: request.duration_secs,
            renewal_count: 0,
            max_renewals: request.max_renewals,
            auto_renewal_enabled: request.auto_renewal_enabled,
            status: LeaseStatus::Active,
            revoked_at: None,
            revocation_reason: None,
            expired_at: None,
            renewals: Vec::new(),
        };
        let bytes = encode(&lease)?;
        if !self
            .barrier
            .compare_and_put(&lease_key(&lease.id), None, &bytes)
            .await?
        {
            return Err(LeaseError::Contention { lease_id: lease.id });
        }
        Ok(lease)
    }

    /// Extend an active lease by `increment_secs` (default: its original
    /// duration).
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] if no such lease exists.
    /// - [`LeaseError::NotRenewable`] if it is not `Active` or already past
    ///   `expires_at`.
    /// - [`LeaseError::RenewalLimitExceeded`] if `renewal_count >= max_renewals`.
    /// - [`LeaseError::Contention`] if concurrent updates kept winning.
    pub async fn renew(
        &self,
        actor: &str,
        lease_id: &str,
        increment_secs: Option<u64>,
    ) -> Result<Lease, LeaseError> {
        let result = self.renew_inner(actor, lease_id, increment_secs).await;
        match &result {
            Ok(lease) => info!(
                lease_id,
                renewal_count = lease.renewal_count,
                expires_at = %lease.expires_at,
                actor,
                "lease renewed"
            ),
            Err(e) => debug!(lease_id, error = %e, "lease renewal rejected"),
        }
        self.record(EventKind::LeaseRenewed, actor, lease_id, result.as_ref().err())
            .await;
        result
    }

    async fn renew_inner(
        &self,
        actor: &str,
        lease_id: &str,
        increment_secs: Option<u64>,
    ) -> Result<Lease, LeaseError> {
        if increment_secs == Some(0) {
            return Err(LeaseError::InvalidRequest {
                reason: "renewal increment must be positive".to_owned(),
            });
        }
        let (lease, _) = self
            .update(lease_id, |mut lease| {
                let now = self.clock.now();
                if lease.status != LeaseStatus::Active {
                    return Err(LeaseError::NotRenewable {
                        lease_id: lease.id,
                        reason: format!("lease is {:?}", lease.status).to_lowercase(),
                    });
                }
                if now > lease.expires_at {
                    return Err(LeaseError::NotRenewable {
                        lease_id: lease.id,
                        reason: "lease is past its expiry".to_owned(),
                    });
                }
                if lease.renewal_count >= lease.max_renewals {
                    return Err(LeaseError::RenewalLimitExceeded {
                        lease_id: lease.id,
                        max_renewals: lease.max_renewals,
                    });
                }
                let increment = increment_secs.unwrap_or(lease.duration_secs);
                lease.extend(now, increment, false, actor)?;
                Ok(Some(lease))
            })
            .await?;
        Ok(lease)
    }

    /// Revoke a lease. A no-op on leases that are already terminal.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] if no such lease exists.
    /// - [`LeaseError::Contention`] if concurrent updates kept winning.
    pub async fn revoke(&self, actor: &str, lease_id: &str, reason: &str) -> Result<(), LeaseError> {
        let result = self
            .update(lease_id, |mut lease| {
                if lease.status != LeaseStatus::Active {
                    return Ok(None);
                }
                lease.status = LeaseStatus::Revoked;
                lease.revoked_at = Some(self.clock.now());
                lease.revocation_reason = Some(reason.to_owned());
                Ok(Some(lease))
            })
            .await;

        match result {
            Ok((lease, true)) => {
                info!(lease_id, actor, reason, "lease revoked");
                self.notify_revoker(&lease, RevocationCause::Revoked).await;
                self.record(EventKind::LeaseRevoked, actor, lease_id, None).await;
                Ok(())
            }
            Ok((lease, false)) => {
                debug!(lease_id, status = ?lease.status, "revoke on terminal lease ignored");
                Ok(())
            }
            Err(e) => {
                self.record(EventKind::LeaseRevoked, actor, lease_id, Some(&e)).await;
                Err(e)
            }
        }
    }

    /// Fetch a lease by id.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] if no such lease exists.
    pub async fn lookup(&self, lease_id: &str) -> Result<Lease, LeaseError> {
        let bytes = self
            .barrier
            .get(&lease_key(lease_id))
            .await?
            .ok_or_else(|| LeaseError::NotFound {
                lease_id: lease_id.to_owned(),
            })?;
        decode(lease_id, &bytes)
    }

    /// All leases, optionally only those whose secret path starts with
    /// `secret_prefix`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] if the barrier fails or is sealed.
    pub async fn list(&self, secret_prefix: Option<&str>) -> Result<Vec<Lease>, LeaseError> {
        let prefix = secret_prefix.map(|p| p.trim_start_matches('/'));
        let mut leases = Vec::new();
        for key in self.barrier.list(LEASE_PREFIX).await? {
            let id = key.strip_prefix(LEASE_PREFIX).unwrap_or(key.as_str());
            let Some(bytes) = self.barrier.get(&key).await? else {
                continue;
            };
            match decode(id, &bytes) {
                Ok(lease) if prefix.is_none_or(|p| lease.secret_path.starts_with(p)) => {
                    leases.push(lease);
                }
                Ok(_) => {}
                Err(e) => warn!(lease_id = %id, error = %e, "skipping unreadable lease"),
            }
        }
        leases.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then_with(|| a.id.cmp(&b.id)));
        Ok(leases)
    }

    /// One expiry sweep over every lease.
    ///
    /// Active leases with auto-renewal and renewals left are renewed by
    /// their original duration when `expires_at` is within the auto-renew
    /// threshold of now, on either side; an overdue one is extended from now.
    /// Any other active lease past `expires_at` becomes `Expired` and its
    /// credential is invalidated. Each lease is handled on its own; a
    /// failure is counted and logged without stopping the sweep.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] only if the lease index cannot be
    /// listed (for example while sealed).
    pub async fn sweep(&self) -> Result<SweepReport, LeaseError> {
        let keys = self.barrier.list(LEASE_PREFIX).await?;
        let mut report = SweepReport {
            scanned: keys.len(),
            ..SweepReport::default()
        };

        for key in &keys {
            let id = key.strip_prefix(LEASE_PREFIX).unwrap_or(key.as_str());
            match self.sweep_one(id).await {
                Ok(SweepOutcome::Expired) => report.expired = report.expired.saturating_add(1),
                Ok(SweepOutcome::AutoRenewed) => {
                    report.auto_renewed = report.auto_renewed.saturating_add(1);
                }
                Ok(SweepOutcome::Untouched) => {}
                Err(e) => {
                    warn!(lease_id = %id, error = %e, "lease sweep failed for lease");
                    report.failed = report.failed.saturating_add(1);
                }
            }
        }

        if report.expired > 0 || report.auto_renewed > 0 || report.failed > 0 {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                auto_renewed = report.auto_renewed,
                failed = report.failed,
                "lease sweep complete"
            );
        }
        Ok(report)
    }

    async fn sweep_one(&self, lease_id: &str) -> Result<SweepOutcome, LeaseError> {
        let threshold = self.options.auto_renew_threshold;
        let mut outcome = SweepOutcome::Untouched;
        let (lease, changed) = self
            .update(lease_id, |mut lease| {
                outcome = SweepOutcome::Untouched;
                if lease.status != LeaseStatus::Active {
                    return Ok(None);
                }
                let now = self.clock.now();
                let overdue = lease.expires_at < now;
                let within_threshold = if overdue {
                    now.signed_duration_since(lease.expires_at) <= threshold
                } else {
                    lease.expires_at.signed_duration_since(now) <= threshold
                };
                let renewable = lease.auto_renewal_enabled
                    && lease.renewal_count < lease.max_renewals
                    && within_threshold;
                if !renewable {
                    if !overdue {
                        return Ok(None);
                    }
                    lease.status = LeaseStatus::Expired;
                    lease.expired_at = Some(now);
                    outcome = SweepOutcome::Expired;
                    return Ok(Some(lease));
                }
                let increment = lease.duration_secs;
                lease.extend(now, increment, true, SWEEPER_ACTOR)?;
                outcome = SweepOutcome::AutoRenewed;
                Ok(Some(lease))
            })
            .await?;

        if !changed {
            return Ok(SweepOutcome::Untouched);
        }
        match outcome {
            SweepOutcome::Expired => {
                info!(lease_id, secret = %lease.secret_path, "lease expired");
                self.notify_revoker(&lease, RevocationCause::Expired).await;
                self.record(EventKind::LeaseExpired, SWEEPER_ACTOR, lease_id, None)
                    .await;
            }
            SweepOutcome::AutoRenewed => {
                info!(
                    lease_id,
                    renewal_count = lease.renewal_count,
                    expires_at = %lease.expires_at,
                    "lease auto-renewed"
                );
                self.record(EventKind::LeaseRenewed, SWEEPER_ACTOR, lease_id, None)
                    .await;
            }
            SweepOutcome::Untouched => {}
        }
        Ok(outcome)
    }

    /// Read-modify-write a lease until the compare-and-put wins.
    ///
    /// `apply` returns `None` to leave the lease unchanged. Returns the
    /// resulting lease and whether it was written.
    async fn update<F>(&self, lease_id: &str, mut apply: F) -> Result<(Lease, bool), LeaseError>
    where
        F: FnMut(Lease) -> Result<Option<Lease>, LeaseError> + Send,
    {
        let key = lease_key(lease_id);
        for attempt in 1..=MAX_ATTEMPTS {
            let snapshot = self
                .barrier
                .read_for_update(&key)
                .await?
                .ok_or_else(|| LeaseError::NotFound {
                    lease_id: lease_id.to_owned(),
                })?;
            let current = decode(lease_id, &snapshot.value)?;
            let Some(updated) = apply(current.clone())? else {
                return Ok((current, false));
            };
            if self
                .barrier
                .compare_and_put(&key, Some(&snapshot.raw), &encode(&updated)?)
                .await?
            {
                return Ok((updated, true));
            }
            debug!(lease_id, attempt, "lease changed concurrently, retrying");
        }
        Err(LeaseError::Contention {
            lease_id: lease_id.to_owned(),
        })
    }

    async fn notify_revoker(&self, lease: &Lease, cause: RevocationCause) {
        if let Err(e) = self.revoker.invalidate(lease, cause).await {
            warn!(lease_id = %lease.id, ?cause, error = %e, "credential invalidation failed");
        }
    }

    async fn record(&self, kind: EventKind, actor: &str, resource: &str, error: Option<&LeaseError>) {
        let Some(audit) = &self.audit else {
            return;
        };
        let event = match error {
            None => AuditEvent::success(kind, actor),
            Some(e) => AuditEvent::failure(kind, actor, e.kind()),
        };
        audit.emit(event.resource(resource).at(self.clock.now())).await;
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn lease_key(lease_id: &str) -> String {
    format!("{LEASE_PREFIX}{lease_id}")
}

fn seconds(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

fn decode(lease_id: &str, bytes: &[u8]) -> Result<Lease, LeaseError> {
    serde_json::from_slice(bytes).map_err(|e| LeaseError::Corrupted {
        lease_id: lease_id.to_owned(),
        reason: e.to_string(),
    })
}

fn encode(lease: &Lease) -> Result<Vec<u8>, LeaseError> {
    serde_json::to_vec(lease).map_err(|e| LeaseError::Corrupted {
        lease_id: lease.id.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use strongroom_storage::MemoryBackend;
    use tokio::sync::Mutex;

    use super::*;
    use crate::audit::MemoryAuditBackend;
    use crate::clock::ManualClock;
    use crate::encryption::EncryptionService;
    use crate::error::ErrorKind;
    use crate::seal::SealManager;
    use crate::secret::SecretStoreOptions;

    struct Fixture {
        seal: Arc<SealManager>,
        clock: Arc<ManualClock>,
        leases: LeaseManager,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(MemoryBackend::new());
        let seal = Arc::new(SealManager::new(storage.clone()));
        seal.initialize("root", 3, 2).await.unwrap();
        let encryption = EncryptionService::new(Arc::clone(&seal));
        let barrier = Barrier::new(storage, encryption.clone());
        let secrets = Arc::new(SecretStore::new(
            barrier.clone(),
            encryption,
            SecretStoreOptions::default(),
        ));
        secrets.write("root", "db/creds", b"pw", None).await.unwrap();

        let clock = Arc::new(ManualClock::default());
        let leases = LeaseManager::new(
            barrier,
            secrets,
            clock.clone(),
            LeaseManagerOptions::default(),
        );
        Fixture {
            seal,
            clock,
            leases,
        }
    }

    fn request(duration_secs: u64, max_renewals: u32, auto: bool) -> LeaseRequest {
        LeaseRequest {
            secret_path: "db/creds".to_owned(),
            requester: "svc-billing".to_owned(),
            duration_secs,
            max_renewals,
            auto_renewal_enabled: auto,
        }
    }

    #[derive(Default)]
    struct RecordingRevoker {
        calls: Mutex<Vec<(String, RevocationCause)>>,
    }

    #[async_trait::async_trait]
    impl CredentialRevoker for RecordingRevoker {
        async fn invalidate(&self, lease: &Lease, cause: RevocationCause) -> Result<(), LeaseError> {
            self.calls.lock().await.push((lease.id.clone(), cause));
            Ok(())
        }
    }

    // ── create / lookup ──────────────────────────────────────────────

    #[tokio::test]
    async fn create_issues_active_lease() {
        let f = fixture().await;
        let lease = f.leases.create("svc", &request(60, 2, false)).await.unwrap();

        assert_eq!(lease.status, LeaseStatus::Active);
        assert_eq!(lease.expires_at - lease.issued_at, Duration::seconds(60));
        assert_eq!(lease.issued_at, f.clock.now());
        assert_eq!(f.leases.lookup(&lease.id).await.unwrap(), lease);
    }

    #[tokio::test]
    async fn create_validates_duration_and_secret() {
        let f = fixture().await;
        let err = f.leases.create("svc", &request(0, 0, false)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let mut missing = request(60, 0, false);
        missing.secret_path = "nope".to_owned();
        let err = f.leases.create("svc", &missing).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecretNotFound);
    }

    #[tokio::test]
    async fn lookup_unknown_lease() {
        let f = fixture().await;
        let err = f.leases.lookup("does-not-exist").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseNotFound);
    }

    // ── renew ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn renew_extends_by_original_duration_and_records_history() {
        let f = fixture().await;
        let lease = f.leases.create("svc", &request(60, 3, false)).await.unwrap();
        f.clock.advance(Duration::seconds(30));

        let renewed = f.leases.renew("svc", &lease.id, None).await.unwrap();
        assert_eq!(renewed.expires_at, lease.expires_at + Duration::seconds(60));
        assert_eq!(renewed.renewal_count, 1);
        assert_eq!(renewed.renewals.len(), 1);
        assert!(!renewed.renewals[0].automatic);
        assert_eq!(renewed.renewals[0].previous_expires_at, lease.expires_at);

        let again = f.leases.renew("svc", &lease.id, Some(10)).await.unwrap();
        assert_eq!(again.expires_at, renewed.expires_at + Duration::seconds(10));
    }

    #[tokio::test]
    async fn renew_past_limit_fails() {
        let f = fixture().await;
        let lease = f.leases.create("svc", &request(60, 1, false)).await.unwrap();
        f.leases.renew("svc", &lease.id, None).await.unwrap();
        let err = f.leases.renew("svc", &lease.id, None).await.unwrap_err();
        assert!(matches!(
            err,
            LeaseError::RenewalLimitExceeded { max_renewals: 1, .. }
        ));
    }

    #[tokio::test]
    async fn renew_after_expiry_time_is_not_renewable() {
        let f = fixture().await;
        let lease = f.leases.create("svc", &request(60, 5, false)).await.unwrap();
        f.clock.advance(Duration::seconds(61));
        let err = f.leases.renew("svc", &lease.id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseNotRenewable);
    }

    #[tokio::test]
    async fn renew_checks_status_before_limit() {
        let f = fixture().await;
        let lease = f.leases.create("svc", &request(60, 0, false)).await.unwrap();
        f.leases.revoke("ops", &lease.id, "rotated").await.unwrap();
        let err = f.leases.renew("svc", &lease.id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseNotRenewable);

        let err = f.leases.renew("svc", "missing", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseNotFound);
    }

    // ── revoke ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn revoke_is_terminal_and_idempotent() {
        let revoker = Arc::new(RecordingRevoker::default());
        let mut f = fixture().await;
        f.leases = f.leases.with_revoker(revoker.clone());

        let lease = f.leases.create("svc", &request(60, 0, false)).await.unwrap();
        f.leases.revoke("ops", &lease.id, "compromised").await.unwrap();
        f.leases.revoke("ops", &lease.id, "again").await.unwrap();

        let stored = f.leases.lookup(&lease.id).await.unwrap();
        assert_eq!(stored.status, LeaseStatus::Revoked);
        assert_eq!(stored.revocation_reason.as_deref(), Some("compromised"));
        assert_eq!(
            *revoker.calls.lock().await,
            vec![(lease.id.clone(), RevocationCause::Revoked)]
        );
    }

    // ── sweep ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn sweep_expires_past_due_leases() {
        let revoker = Arc::new(RecordingRevoker::default());
        let mut f = fixture().await;
        f.leases = f.leases.with_revoker(revoker.clone());

        let short = f.leases.create("svc", &request(60, 0, false)).await.unwrap();
        let long = f.leases.create("svc", &request(3600, 0, false)).await.unwrap();
        f.clock.advance(Duration::seconds(61));

        let report = f.leases.sweep().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                scanned: 2,
                expired: 1,
                auto_renewed: 0,
                failed: 0
            }
        );
        assert_eq!(f.leases.lookup(&short.id).await.unwrap().status, LeaseStatus::Expired);
        assert_eq!(f.leases.lookup(&long.id).await.unwrap().status, LeaseStatus::Active);
        assert_eq!(revoker.calls.lock().await.len(), 1);

        let err = f.leases.renew("svc", &short.id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseNotRenewable);
    }

    #[tokio::test]
    async fn sweep_auto_renews_within_threshold() {
        let f = fixture().await;
        let lease = f.leases.create("svc", &request(600, 1, true)).await.unwrap();

        f.clock.advance(Duration::seconds(200));
        assert_eq!(f.leases.sweep().await.unwrap().auto_renewed, 0);

        f.clock.advance(Duration::seconds(200));
        let report = f.leases.sweep().await.unwrap();
        assert_eq!(report.auto_renewed, 1);

        let renewed = f.leases.lookup(&lease.id).await.unwrap();
        assert_eq!(renewed.expires_at, lease.expires_at + Duration::seconds(600));
        assert!(renewed.renewals[0].automatic);
        assert_eq!(renewed.renewals[0].actor, SWEEPER_ACTOR);

        // Renewals exhausted: the lease runs out and expires.
        f.clock.advance(Duration::seconds(1000));
        let report = f.leases.sweep().await.unwrap();
        assert_eq!((report.auto_renewed, report.expired), (0, 1));
    }

    #[tokio::test]
    async fn sweep_renews_recently_lapsed_auto_renew_lease() {
        let revoker = Arc::new(RecordingRevoker::default());
        let mut f = fixture().await;
        f.leases = f.leases.with_revoker(revoker.clone());
        let lease = f.leases.create("svc", &request(60, 5, true)).await.unwrap();
        f.clock.advance(Duration::seconds(61));

        let report = f.leases.sweep().await.unwrap();
        assert_eq!((report.auto_renewed, report.expired), (1, 0));

        let renewed = f.leases.lookup(&lease.id).await.unwrap();
        assert_eq!(renewed.status, LeaseStatus::Active);
        assert_eq!(renewed.renewal_count, 1);
        assert_eq!(renewed.expires_at, f.clock.now() + Duration::seconds(60));
        assert!(renewed.is_live_at(f.clock.now()));
        assert!(revoker.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn sweep_expires_auto_renew_lease_past_threshold() {
        let f = fixture().await;
        let lease = f.leases.create("svc", &request(60, 5, true)).await.unwrap();
        // Default threshold is 300 s.
        f.clock.advance(Duration::seconds(60 + 301));

        let report = f.leases.sweep().await.unwrap();
        assert_eq!((report.auto_renewed, report.expired), (0, 1));
        let expired = f.leases.lookup(&lease.id).await.unwrap();
        assert_eq!(expired.status, LeaseStatus::Expired);
        assert_eq!(expired.renewal_count, 0);
    }

    #[tokio::test]
    async fn sweep_counts_corrupt_records_and_continues() {
        let storage = Arc::new(MemoryBackend::new());
        let seal = Arc::new(SealManager::new(storage.clone()));
        seal.initialize("root", 3, 2).await.unwrap();
        let encryption = EncryptionService::new(Arc::clone(&seal));
        let barrier = Barrier::new(storage, encryption.clone());
        let secrets = Arc::new(SecretStore::new(
            barrier.clone(),
            encryption,
            SecretStoreOptions::default(),
        ));
        secrets.write("root", "db/creds", b"pw", None).await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let leases = LeaseManager::new(
            barrier.clone(),
            secrets,
            clock.clone(),
            LeaseManagerOptions::default(),
        );

        leases.create("svc", &request(10, 0, false)).await.unwrap();
        barrier.put("sys/leases/garbage", b"not json").await.unwrap();
        clock.advance(Duration::seconds(11));

        let report = leases.sweep().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.expired, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn sweep_fails_sealed_when_sealed() {
        let f = fixture().await;
        f.seal.seal("root").await.unwrap();
        let err = f.leases.sweep().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Sealed);
    }

    // ── list & audit ─────────────────────────────────────────────────

    #[tokio::test]
    async fn list_filters_by_secret_prefix() {
        let f = fixture().await;
        let a = f.leases.create("svc", &request(60, 0, false)).await.unwrap();
        f.clock.advance(Duration::seconds(1));
        let b = f.leases.create("svc", &request(60, 0, false)).await.unwrap();

        let all = f.leases.list(None).await.unwrap();
        assert_eq!(all.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(), vec![a.id.as_str(), b.id.as_str()]);
        assert_eq!(f.leases.list(Some("db/")).await.unwrap().len(), 2);
        assert!(f.leases.list(Some("api/")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lease_transitions_are_audited() {
        let audit = Arc::new(AuditManager::new());
        let sink = Arc::new(MemoryAuditBackend::new());
        audit.add_backend(sink.clone()).await;
        let mut f = fixture().await;
        f.leases = f.leases.with_audit(audit);

        let lease = f.leases.create("svc", &request(60, 0, false)).await.unwrap();
        f.leases.renew("svc", &lease.id, None).await.unwrap_err();
        f.clock.advance(Duration::seconds(61));
        f.leases.sweep().await.unwrap();

        let kinds: Vec<EventKind> = sink.events().await.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::LeaseIssued, EventKind::LeaseRenewed, EventKind::LeaseExpired]
        );
        let expired = &sink.events_of(EventKind::LeaseExpired).await[0];
        assert_eq!(expired.actor, SWEEPER_ACTOR);
        assert_eq!(expired.resource.as_deref(), Some(lease.id.as_str()));
    }
}
