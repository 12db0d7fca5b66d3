//! Lease routes: `/v1/sys/leases/*`
//!
//! Create, look up, renew, revoke and list leases. The requester of a new
//! lease is the calling principal.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use strongroom_core::{Lease, LeaseRequest};

use crate::error::AppError;
use crate::middleware::Principal;
use crate::state::AppState;

/// Build the `/v1/sys/leases` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_leases))
        .route("/create", post(create_lease))
        .route("/lookup", post(lookup_lease))
        .route("/renew", post(renew_lease))
        .route("/revoke", post(revoke_lease))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateLeaseRequest {
    pub secret_path: String,
    pub duration_secs: u64,
    #[serde(default)]
    pub max_renewals: u32,
    #[serde(default)]
    pub auto_renewal_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct LeaseIdRequest {
    pub lease_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RenewLeaseRequest {
    pub lease_id: String,
    /// Seconds to add; defaults to the lease's original duration.
    pub increment: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeLeaseRequest {
    pub lease_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Only leases on secrets under this path.
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListLeasesResponse {
    pub leases: Vec<Lease>,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn create_lease(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateLeaseRequest>,
) -> Result<(StatusCode, Json<Lease>), AppError> {
    let request = LeaseRequest {
        secret_path: body.secret_path,
        requester: principal.0.clone(),
        duration_secs: body.duration_secs,
        max_renewals: body.max_renewals,
        auto_renewal_enabled: body.auto_renewal_enabled,
    };
    let lease = state
        .lease_manager
        .create(principal.as_str(), &request)
        .await?;
    Ok((StatusCode::CREATED, Json(lease)))
}

async fn lookup_lease(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LeaseIdRequest>,
) -> Result<Json<Lease>, AppError> {
    Ok(Json(state.lease_manager.lookup(&body.lease_id).await?))
}

async fn renew_lease(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<RenewLeaseRequest>,
) -> Result<Json<Lease>, AppError> {
    Ok(Json(
        state
            .lease_manager
            .renew(principal.as_str(), &body.lease_id, body.increment)
            .await?,
    ))
}

async fn revoke_lease(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<RevokeLeaseRequest>,
) -> Result<StatusCode, AppError> {
    let reason = body.reason.as_deref().unwrap_or("revoked by operator");
    state
        .lease_manager
        .revoke(principal.as_str(), &body.lease_id, reason)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_leases(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListLeasesResponse>, AppError> {
    Ok(Json(ListLeasesResponse {
        leases: state.lease_manager.list(query.prefix.as_deref()).await?,
    }))
}
