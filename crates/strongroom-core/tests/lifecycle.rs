//! End-to-end behaviour of the seal, secret and lease layers wired together
//! over in-memory storage.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Duration;
use strongroom_core::error::{LeaseError, SealError, SecretError};
use strongroom_core::shamir;
use strongroom_core::{
    AuditManager, Barrier, EncryptionService, ErrorKind, EventKind, InitResult, LeaseManager,
    LeaseManagerOptions, LeaseRequest, LeaseStatus, ManualClock, MemoryAuditBackend, MetadataUpdate,
    SealManager, SecretStore, SecretStoreOptions,
};
use strongroom_storage::{MemoryBackend, StorageBackend, StorageError};
use tokio::sync::Barrier as StartLine;

/// Memory storage that can park the next few readers of one key until all
/// of them hold the same value, and counts compare-and-swaps that lost.
#[derive(Default)]
struct RaceStorage {
    inner: MemoryBackend,
    gate: Mutex<Option<Gate>>,
    lost_swaps: AtomicUsize,
}

struct Gate {
    key: String,
    readers_left: usize,
    start: Arc<StartLine>,
}

impl RaceStorage {
    /// The next `readers` reads of `key` return only once all of them have
    /// read, so every one of them starts from the same stored value.
    fn hold_readers(&self, key: &str, readers: usize) {
        *self.gate.lock().unwrap() = Some(Gate {
            key: key.to_owned(),
            readers_left: readers,
            start: Arc::new(StartLine::new(readers)),
        });
    }

    fn lost_swaps(&self) -> usize {
        self.lost_swaps.load(Ordering::SeqCst)
    }

    fn start_line_for(&self, key: &str) -> Option<Arc<StartLine>> {
        let mut gate = self.gate.lock().unwrap();
        let gate = gate
            .as_mut()
            .filter(|g| g.key == key && g.readers_left > 0)?;
        gate.readers_left -= 1;
        Some(Arc::clone(&gate.start))
    }
}

#[async_trait::async_trait]
impl StorageBackend for RaceStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self.inner.get(key).await?;
        if let Some(start) = self.start_line_for(key) {
            start.wait().await;
        }
        Ok(value)
    }
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.inner.put(key, value).await
    }
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        let swapped = self.inner.compare_and_swap(key, expected, new).await?;
        if !swapped {
            self.lost_swaps.fetch_add(1, Ordering::SeqCst);
        }
        Ok(swapped)
    }
}

struct Vault {
    storage: Arc<RaceStorage>,
    seal: Arc<SealManager>,
    secrets: Arc<SecretStore>,
    leases: Arc<LeaseManager>,
    clock: Arc<ManualClock>,
    audit: Arc<MemoryAuditBackend>,
    init: InitResult,
}

async fn vault(shares: u8, threshold: u8) -> Vault {
    let storage = Arc::new(RaceStorage::default());
    let audit_backend = Arc::new(MemoryAuditBackend::new());
    let audit = Arc::new(AuditManager::new());
    audit.add_backend(audit_backend.clone()).await;

    let seal = Arc::new(SealManager::new(storage.clone()).with_audit(Arc::clone(&audit)));
    let init = seal.initialize("root", shares, threshold).await.unwrap();

    let encryption = EncryptionService::new(Arc::clone(&seal));
    let barrier = Barrier::new(storage.clone(), encryption.clone());
    let secrets = Arc::new(
        SecretStore::new(barrier.clone(), encryption, SecretStoreOptions::default())
            .with_audit(Arc::clone(&audit)),
    );
    let clock = Arc::new(ManualClock::default());
    let leases = Arc::new(
        LeaseManager::new(
            barrier,
            Arc::clone(&secrets),
            clock.clone(),
            LeaseManagerOptions::default(),
        )
        .with_audit(audit),
    );

    Vault {
        storage,
        seal,
        secrets,
        leases,
        clock,
        audit: audit_backend,
        init,
    }
}

fn lease_request(duration_secs: u64, max_renewals: u32) -> LeaseRequest {
    LeaseRequest {
        secret_path: "db/creds".to_owned(),
        requester: "billing-service".to_owned(),
        duration_secs,
        max_renewals,
        auto_renewal_enabled: false,
    }
}

fn lease_key(lease_id: &str) -> String {
    format!("sys/leases/{lease_id}")
}

#[tokio::test]
async fn seal_and_unseal_with_three_of_five_keys() {
    let v = vault(5, 3).await;
    v.secrets
        .write("ops", "db/creds", br#"{"password":"hunter2"}"#, None)
        .await
        .unwrap();

    let status = v.seal.seal("ops").await.unwrap();
    assert!(status.sealed);
    let err = v.secrets.read("db/creds", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sealed);

    let keys = &v.init.unseal_keys;
    assert_eq!(v.seal.unseal("ops", &keys[4]).await.unwrap().progress, 1);
    assert_eq!(v.seal.unseal("ops", &keys[0]).await.unwrap().progress, 2);
    let status = v.seal.unseal("ops", &keys[2]).await.unwrap();
    assert!(!status.sealed);
    assert_eq!(status.progress, 0);

    let secret = v.secrets.read("db/creds", None).await.unwrap();
    assert_eq!(secret.data.as_slice(), br#"{"password":"hunter2"}"#);
}

#[tokio::test]
async fn hex_unseal_keys_are_accepted() {
    let v = vault(3, 2).await;
    v.seal.seal("ops").await.unwrap();
    v.seal.unseal("ops", &v.init.unseal_keys_hex[0]).await.unwrap();
    let status = v.seal.unseal("ops", &v.init.unseal_keys_hex[2]).await.unwrap();
    assert!(!status.sealed);
}

#[tokio::test]
async fn foreign_key_fails_verification_and_resets_progress() {
    let v = vault(5, 3).await;
    let other = vault(5, 3).await;
    v.seal.seal("ops").await.unwrap();

    v.seal.unseal("ops", &v.init.unseal_keys[0]).await.unwrap();
    v.seal.unseal("ops", &v.init.unseal_keys[1]).await.unwrap();
    // x = 3 from a different vault: well-formed, distinct, wrong.
    let err = v
        .seal
        .unseal("ops", &other.init.unseal_keys[2])
        .await
        .unwrap_err();
    assert!(matches!(err, SealError::MasterKeyVerificationFailed));

    let status = v.seal.status().await.unwrap();
    assert!(status.sealed);
    assert_eq!(status.progress, 0);

    for key in &v.init.unseal_keys[2..] {
        v.seal.unseal("ops", key).await.unwrap();
    }
    v.seal.unseal("ops", &v.init.unseal_keys[0]).await.unwrap();
    assert!(!v.seal.is_sealed().await);
}

#[tokio::test]
async fn initialize_twice_is_rejected() {
    let v = vault(3, 2).await;
    let err = v.seal.initialize("root", 3, 2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyInitialized);
}

#[tokio::test]
async fn check_and_set_guards_concurrent_editors() {
    let v = vault(3, 2).await;

    assert_eq!(v.secrets.write("alice", "db/creds", b"v1", Some(0)).await.unwrap(), 1);
    let err = v
        .secrets
        .write("bob", "db/creds", b"again", Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, SecretError::CasConflict { current: 1, .. }));

    assert_eq!(v.secrets.write("alice", "db/creds", b"v2", Some(1)).await.unwrap(), 2);
    let err = v
        .secrets
        .write("bob", "db/creds", b"stale", Some(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SecretError::CasConflict { current: 2, .. }));

    let latest = v.secrets.read("db/creds", None).await.unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(latest.data.as_slice(), b"v2");
}

#[tokio::test]
async fn old_versions_are_pruned_past_max_versions() {
    let v = vault(3, 2).await;
    v.secrets.write("ops", "app/config", b"seed", None).await.unwrap();
    v.secrets
        .update_metadata(
            "ops",
            "app/config",
            MetadataUpdate {
                max_versions: Some(3),
                cas_required: None,
            },
        )
        .await
        .unwrap();
    for i in 2..=5u32 {
        let version = v
            .secrets
            .write("ops", "app/config", format!("value-{i}").as_bytes(), None)
            .await
            .unwrap();
        assert_eq!(version, i);
    }

    let meta = v.secrets.metadata("app/config").await.unwrap();
    let retained: Vec<u32> = meta.versions.iter().map(|m| m.version).collect();
    assert_eq!(retained, vec![3, 4, 5]);
    assert_eq!(meta.current_version, 5);

    let err = v.secrets.read("app/config", Some(2)).await.unwrap_err();
    assert!(matches!(err, SecretError::VersionNotFound { version: 2, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_cas_writers_produce_exactly_one_winner() {
    let v = vault(3, 2).await;
    v.secrets.write("ops", "db/creds", b"v1", None).await.unwrap();
    v.storage.hold_readers("secret/db/creds", 8);

    let mut handles = Vec::new();
    for i in 0..8 {
        let secrets = Arc::clone(&v.secrets);
        handles.push(tokio::spawn(async move {
            secrets
                .write(&format!("writer-{i}"), "db/creds", b"v2", Some(1))
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(version) => {
                assert_eq!(version, 2);
                winners += 1;
            }
            Err(e) => assert_eq!(e.kind(), ErrorKind::CasConflict),
        }
    }
    assert_eq!(winners, 1);
    // Every loser read version 1, lost the swap, re-read and saw version 2.
    assert_eq!(v.storage.lost_swaps(), 7);
    assert_eq!(v.secrets.metadata("db/creds").await.unwrap().current_version, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unconditional_writers_all_land() {
    let v = vault(3, 2).await;
    v.storage.hold_readers("secret/counter", 4);

    let mut handles = Vec::new();
    for i in 0..4 {
        let secrets = Arc::clone(&v.secrets);
        handles.push(tokio::spawn(async move {
            secrets.write("ops", "counter", &[i], None).await
        }));
    }
    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap().unwrap());
    }
    versions.sort_unstable();
    assert_eq!(versions, vec![1, 2, 3, 4]);
    assert!(v.storage.lost_swaps() >= 3);

    let meta = v.secrets.metadata("counter").await.unwrap();
    assert_eq!(meta.current_version, 4);
    assert_eq!(meta.versions.len(), 4);
}

#[tokio::test]
async fn renewal_limit_is_enforced() {
    let v = vault(3, 2).await;
    v.secrets.write("ops", "db/creds", b"pw", None).await.unwrap();
    let lease = v.leases.create("svc", &lease_request(60, 2)).await.unwrap();

    let first = v.leases.renew("svc", &lease.id, Some(30)).await.unwrap();
    assert_eq!(first.renewal_count, 1);
    assert_eq!(first.expires_at, lease.expires_at + Duration::seconds(30));
    let second = v.leases.renew("svc", &lease.id, None).await.unwrap();
    assert_eq!(second.renewal_count, 2);

    let err = v.leases.renew("svc", &lease.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        LeaseError::RenewalLimitExceeded { max_renewals: 2, .. }
    ));
    assert_eq!(v.leases.lookup(&lease.id).await.unwrap().renewal_count, 2);
}

#[tokio::test]
async fn swept_lease_cannot_be_renewed() {
    let v = vault(3, 2).await;
    v.secrets.write("ops", "db/creds", b"pw", None).await.unwrap();
    let lease = v.leases.create("svc", &lease_request(60, 5)).await.unwrap();

    v.clock.advance(Duration::seconds(61));
    let report = v.leases.sweep().await.unwrap();
    assert_eq!(report.expired, 1);

    let err = v.leases.renew("svc", &lease.id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LeaseNotRenewable);
    assert_eq!(
        v.leases.lookup(&lease.id).await.unwrap().status,
        LeaseStatus::Expired
    );

    let expired_events = v.audit.events_of(EventKind::LeaseExpired).await;
    assert_eq!(expired_events.len(), 1);
    assert_eq!(expired_events[0].resource.as_deref(), Some(lease.id.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn renew_racing_sweep_past_expiry_never_resurrects() {
    let v = vault(3, 2).await;
    v.secrets.write("ops", "db/creds", b"pw", None).await.unwrap();
    let lease = v.leases.create("svc", &lease_request(30, 5)).await.unwrap();
    v.clock.advance(Duration::seconds(31));
    v.storage.hold_readers(&lease_key(&lease.id), 2);

    let leases = Arc::clone(&v.leases);
    let id = lease.id.clone();
    let renew = tokio::spawn(async move { leases.renew("svc", &id, None).await });
    let leases = Arc::clone(&v.leases);
    let sweep = tokio::spawn(async move { leases.sweep().await });

    let renewed = renew.await.unwrap();
    sweep.await.unwrap().unwrap();

    assert_eq!(renewed.unwrap_err().kind(), ErrorKind::LeaseNotRenewable);
    let after = v.leases.lookup(&lease.id).await.unwrap();
    assert_eq!(after.status, LeaseStatus::Expired);
    assert_eq!(after.renewal_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn renew_racing_auto_renewal_applies_both_extensions() {
    let v = vault(3, 2).await;
    v.secrets.write("ops", "db/creds", b"pw", None).await.unwrap();
    let request = LeaseRequest {
        auto_renewal_enabled: true,
        ..lease_request(600, 5)
    };
    let lease = v.leases.create("svc", &request).await.unwrap();
    // 200 s left, inside the default 300 s auto-renew threshold.
    v.clock.advance(Duration::seconds(400));
    v.storage.hold_readers(&lease_key(&lease.id), 2);

    let leases = Arc::clone(&v.leases);
    let id = lease.id.clone();
    let renew = tokio::spawn(async move { leases.renew("svc", &id, Some(60)).await });
    let leases = Arc::clone(&v.leases);
    let sweep = tokio::spawn(async move { leases.sweep().await });

    renew.await.unwrap().unwrap();
    let report = sweep.await.unwrap().unwrap();
    assert_eq!((report.auto_renewed, report.expired), (1, 0));
    // Both started from the same record; the loser re-read and re-applied.
    assert_eq!(v.storage.lost_swaps(), 1);

    let after = v.leases.lookup(&lease.id).await.unwrap();
    assert_eq!(after.status, LeaseStatus::Active);
    assert_eq!(after.renewal_count, 2);
    assert_eq!(after.renewals.len(), 2);
    assert_eq!(after.expires_at, lease.expires_at + Duration::seconds(660));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn revoke_racing_expiry_has_one_terminal_outcome() {
    let v = vault(3, 2).await;
    v.secrets.write("ops", "db/creds", b"pw", None).await.unwrap();
    let lease = v.leases.create("svc", &lease_request(30, 0)).await.unwrap();
    v.clock.advance(Duration::seconds(31));
    v.storage.hold_readers(&lease_key(&lease.id), 2);

    let leases = Arc::clone(&v.leases);
    let id = lease.id.clone();
    let revoke = tokio::spawn(async move { leases.revoke("ops", &id, "rotated").await });
    let leases = Arc::clone(&v.leases);
    let sweep = tokio::spawn(async move { leases.sweep().await });

    revoke.await.unwrap().unwrap();
    let report = sweep.await.unwrap().unwrap();
    assert_eq!(v.storage.lost_swaps(), 1);

    let after = v.leases.lookup(&lease.id).await.unwrap();
    let expired = v.audit.events_of(EventKind::LeaseExpired).await.len();
    let revoked = v.audit.events_of(EventKind::LeaseRevoked).await.len();
    if after.status == LeaseStatus::Expired {
        assert_eq!((report.expired, expired, revoked), (1, 1, 0));
    } else {
        assert_eq!(after.status, LeaseStatus::Revoked);
        assert_eq!((report.expired, expired, revoked), (0, 0, 1));
    }
}

#[tokio::test]
async fn revoked_lease_stays_revoked() {
    let v = vault(3, 2).await;
    v.secrets.write("ops", "db/creds", b"pw", None).await.unwrap();
    let lease = v.leases.create("svc", &lease_request(30, 5)).await.unwrap();

    v.leases.revoke("ops", &lease.id, "rotated").await.unwrap();
    v.leases.revoke("ops", &lease.id, "again").await.unwrap();
    v.clock.advance(Duration::seconds(60));
    assert_eq!(v.leases.sweep().await.unwrap().expired, 0);

    let after = v.leases.lookup(&lease.id).await.unwrap();
    assert_eq!(after.status, LeaseStatus::Revoked);
    assert_eq!(after.revocation_reason.as_deref(), Some("rotated"));
}

#[tokio::test]
async fn lease_on_deleted_secret_is_refused() {
    let v = vault(3, 2).await;
    v.secrets.write("ops", "db/creds", b"pw", None).await.unwrap();
    v.secrets.soft_delete("ops", "db/creds", &[]).await.unwrap();

    let err = v.leases.create("svc", &lease_request(30, 0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SecretNotFound);
}

#[test]
fn every_threshold_subset_of_a_master_key_recombines() {
    let mut secret = [0u8; 32];
    strongroom_core::crypto::fill_random(&mut secret);
    let shares = shamir::split(&secret, 5, 3).unwrap();

    for a in 0..5 {
        for b in (a + 1)..5 {
            for c in (b + 1)..5 {
                let subset = [shares[a].clone(), shares[b].clone(), shares[c].clone()];
                let recovered = shamir::combine(&subset).unwrap();
                assert_eq!(recovered.as_slice(), &secret);
            }
        }
    }
}
