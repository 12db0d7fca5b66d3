//! Shared application state for `Strongroom` server.
//!
//! One [`AppState`] is built at startup and shared by every handler through
//! `Arc`. The seal manager, secret store and lease manager all sit on the
//! same storage backend and report to the same audit manager.

use std::sync::Arc;

use strongroom_core::{
    AuditManager, Barrier, EncryptionService, LeaseManager, LeaseManagerOptions, SealManager,
    SecretStore, SecretStoreOptions, SystemClock,
};
use strongroom_storage::StorageBackend;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    pub seal_manager: Arc<SealManager>,
    pub secret_store: Arc<SecretStore>,
    pub lease_manager: Arc<LeaseManager>,
    pub audit_manager: Arc<AuditManager>,
}

impl AppState {
    /// Wire the core components over `storage`.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        audit_manager: Arc<AuditManager>,
        secret_options: SecretStoreOptions,
        lease_options: LeaseManagerOptions,
    ) -> Self {
        let seal_manager =
            Arc::new(SealManager::new(Arc::clone(&storage)).with_audit(Arc::clone(&audit_manager)));
        let encryption = EncryptionService::new(Arc::clone(&seal_manager));
        let barrier = Barrier::new(storage, encryption.clone());
        let secret_store = Arc::new(
            SecretStore::new(barrier.clone(), encryption, secret_options)
                .with_audit(Arc::clone(&audit_manager)),
        );
        let lease_manager = Arc::new(
            LeaseManager::new(
                barrier,
                Arc::clone(&secret_store),
                Arc::new(SystemClock),
                lease_options,
            )
            .with_audit(Arc::clone(&audit_manager)),
        );

        Self {
            seal_manager,
            secret_store,
            lease_manager,
            audit_manager,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
