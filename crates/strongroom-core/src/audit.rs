//! Structured audit events for `Strongroom`.
//!
//! The core emits one [`AuditEvent`] per security-relevant state change
//! (init, unseal, seal, secret writes and deletes, lease transitions) for an
//! external hash-chained audit log to consume. Events carry the acting
//! principal, a timestamp, and the outcome. They never carry key material,
//! tokens, or secret payloads; failures record only the [`ErrorKind`].
//!
//! Emission is best-effort. A sink that fails is logged at `warn` and the
//! already-committed state change stands.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::error::{AuditError, ErrorKind};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    VaultInitialized,
    VaultUnsealed,
    VaultSealed,
    SecretWritten,
    SecretDeleted,
    SecretUndeleted,
    SecretDestroyed,
    SecretMetadataUpdated,
    SecretPurged,
    LeaseIssued,
    LeaseRenewed,
    LeaseRevoked,
    LeaseExpired,
}

/// Whether the audited operation took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// A single audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event id (UUID v4).
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Principal id passed in by the caller, or a `system:` actor.
    pub actor: String,
    pub outcome: Outcome,
    /// Secret path or lease id the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Error kind for failed operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    /// A successful event stamped with the current time.
    #[must_use]
    pub fn success(kind: EventKind, actor: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            actor: actor.to_owned(),
            outcome: Outcome::Success,
            resource: None,
            error: None,
        }
    }

    /// A failed event recording only the error's kind.
    #[must_use]
    pub fn failure(kind: EventKind, actor: &str, error: ErrorKind) -> Self {
        Self {
            outcome: Outcome::Failure,
            error: Some(error.as_str().to_owned()),
            ..Self::success(kind, actor)
        }
    }

    /// Attach the resource (secret path or lease id).
    #[must_use]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Override the timestamp (lease events use the lease clock).
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A destination for audit events.
#[async_trait::async_trait]
pub trait AuditBackend: Send + Sync {
    /// The backend's name (for error reporting).
    fn name(&self) -> &str;

    /// Persist one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be persisted.
    async fn log(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Fans events out to every registered backend.
#[derive(Default)]
pub struct AuditManager {
    backends: RwLock<Vec<Arc<dyn AuditBackend>>>,
}

impl AuditManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an audit backend.
    pub async fn add_backend(&self, backend: Arc<dyn AuditBackend>) {
        self.backends.write().await.push(backend);
    }

    /// Deliver `event` to every backend. Failures are logged, never returned.
    pub async fn emit(&self, event: AuditEvent) {
        let backends = self.backends.read().await;
        for backend in backends.iter() {
            if let Err(e) = backend.log(&event).await {
                warn!(
                    backend = backend.name(),
                    event_kind = ?event.kind,
                    error = %e,
                    "audit backend failed"
                );
            }
        }
    }

    /// Check whether any audit backends are configured.
    pub async fn has_backends(&self) -> bool {
        !self.backends.read().await.is_empty()
    }
}

impl std::fmt::Debug for AuditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditManager").finish_non_exhaustive()
    }
}

/// Collects events in memory. Used by tests and embedders that forward
/// events themselves.
#[derive(Debug, Default)]
pub struct MemoryAuditBackend {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event received so far, oldest first.
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    /// Events of one kind, oldest first.
    pub async fn events_of(&self, kind: EventKind) -> Vec<AuditEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl AuditBackend for MemoryAuditBackend {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "memory"
    }

    async fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
