//! System routes: `/v1/sys/*`
//!
//! Vault initialization, the seal/unseal lifecycle, and health checks.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use strongroom_core::SealStatus;

use crate::error::AppError;
use crate::middleware::Principal;
use crate::state::AppState;

/// Build the `/v1/sys` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/init", post(init))
        .route("/unseal", post(unseal))
        .route("/seal", post(seal))
        .route("/seal-status", get(seal_status))
        .route("/health", get(health))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    /// Number of unseal keys to generate.
    pub secret_shares: u8,
    /// Keys required to unseal.
    pub secret_threshold: u8,
}

/// Shown exactly once.
#[derive(Serialize)]
pub struct InitResponse {
    pub unseal_keys: Vec<String>,
    pub unseal_keys_hex: Vec<String>,
    pub root_token: String,
}

#[derive(Debug, Deserialize)]
pub struct UnsealRequest {
    /// Base64 or hex unseal key.
    pub key: String,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn init(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<InitRequest>,
) -> Result<Json<InitResponse>, AppError> {
    let result = state
        .seal_manager
        .initialize(principal.as_str(), body.secret_shares, body.secret_threshold)
        .await?;

    Ok(Json(InitResponse {
        unseal_keys: result.unseal_keys,
        unseal_keys_hex: result.unseal_keys_hex,
        root_token: result.root_token,
    }))
}

/// Submit one unseal key; the returned status shows progress.
async fn unseal(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<UnsealRequest>,
) -> Result<Json<SealStatus>, AppError> {
    Ok(Json(
        state.seal_manager.unseal(principal.as_str(), &body.key).await?,
    ))
}

async fn seal(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<SealStatus>, AppError> {
    Ok(Json(state.seal_manager.seal(principal.as_str()).await?))
}

async fn seal_status(State(state): State<Arc<AppState>>) -> Result<Json<SealStatus>, AppError> {
    Ok(Json(state.seal_manager.status().await?))
}

/// 200 when unsealed, 503 when sealed, 501 when not initialized.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.seal_manager.status().await {
        Ok(s) if !s.initialized => (StatusCode::NOT_IMPLEMENTED, Json(Some(s))),
        Ok(s) if s.sealed => (StatusCode::SERVICE_UNAVAILABLE, Json(Some(s))),
        Ok(s) => (StatusCode::OK, Json(Some(s))),
        Err(e) => {
            tracing::error!(error = %e, "health check could not read seal status");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(None))
        }
    }
}
