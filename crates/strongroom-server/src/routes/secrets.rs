//! Secret routes: `/v1/secret/*`
//!
//! Secret payloads are JSON objects; the core stores their serialized bytes.
//!
//! - `GET    /v1/secret/data/{*path}?version=N`: read
//! - `POST   /v1/secret/data/{*path}`: write, `options.cas` for check-and-set
//! - `POST   /v1/secret/delete/{*path}`: soft-delete versions
//! - `POST   /v1/secret/undelete/{*path}`: restore soft-deleted versions
//! - `POST   /v1/secret/destroy/{*path}`: destroy versions permanently
//! - `GET    /v1/secret/metadata/{*path}`: settings and version states
//! - `POST   /v1/secret/metadata/{*path}`: change `max_versions`/`cas_required`
//! - `DELETE /v1/secret/metadata/{*path}`: purge every version
//! - `GET    /v1/secret/list/{*path}`: list paths under a prefix

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strongroom_core::{ErrorKind, MetadataUpdate, SecretMetadata};

use crate::error::AppError;
use crate::middleware::Principal;
use crate::state::AppState;

/// Build the `/v1/secret` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/data/{*path}", get(read_secret).post(write_secret))
        .route("/delete/{*path}", post(delete_versions))
        .route("/undelete/{*path}", post(undelete_versions))
        .route("/destroy/{*path}", post(destroy_versions))
        .route(
            "/metadata/{*path}",
            get(read_metadata).post(update_metadata).delete(purge_secret),
        )
        .route("/list", get(list_root))
        .route("/list/{*path}", get(list_secrets))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub version: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub options: WriteOptions,
}

#[derive(Debug, Default, Deserialize)]
pub struct WriteOptions {
    /// Expected current version; 0 means "only if absent".
    pub cas: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub version: u32,
}

#[derive(Serialize)]
pub struct SecretResponse {
    pub path: String,
    pub version: u32,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct VersionsRequest {
    #[serde(default)]
    pub versions: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub keys: Vec<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn read_secret(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<SecretResponse>, AppError> {
    let secret = state.secret_store.read(&path, query.version).await?;
    let data = serde_json::from_slice(&secret.data).map_err(|e| AppError::Core {
        kind: ErrorKind::Internal,
        message: format!("stored secret at '{}' is not JSON: {e}", secret.path),
    })?;

    Ok(Json(SecretResponse {
        path: secret.path.clone(),
        version: secret.version,
        data,
        created_at: secret.created_at,
        created_by: secret.created_by.clone(),
    }))
}

async fn write_secret(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(path): Path<String>,
    Json(body): Json<WriteRequest>,
) -> Result<Json<WriteResponse>, AppError> {
    let bytes = serde_json::to_vec(&body.data)
        .map_err(|e| AppError::BadRequest(format!("unserializable secret data: {e}")))?;
    let version = state
        .secret_store
        .write(principal.as_str(), &path, &bytes, body.options.cas)
        .await?;
    Ok(Json(WriteResponse { version }))
}

async fn delete_versions(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(path): Path<String>,
    body: Option<Json<VersionsRequest>>,
) -> Result<StatusCode, AppError> {
    let versions = body.map(|Json(b)| b.versions).unwrap_or_default();
    state
        .secret_store
        .soft_delete(principal.as_str(), &path, &versions)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn undelete_versions(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(path): Path<String>,
    body: Option<Json<VersionsRequest>>,
) -> Result<StatusCode, AppError> {
    let versions = body.map(|Json(b)| b.versions).unwrap_or_default();
    state
        .secret_store
        .undelete(principal.as_str(), &path, &versions)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn destroy_versions(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(path): Path<String>,
    Json(body): Json<VersionsRequest>,
) -> Result<StatusCode, AppError> {
    state
        .secret_store
        .destroy(principal.as_str(), &path, &body.versions)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn read_metadata(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Json<SecretMetadata>, AppError> {
    Ok(Json(state.secret_store.metadata(&path).await?))
}

async fn update_metadata(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(path): Path<String>,
    Json(update): Json<MetadataUpdate>,
) -> Result<Json<SecretMetadata>, AppError> {
    Ok(Json(
        state
            .secret_store
            .update_metadata(principal.as_str(), &path, update)
            .await?,
    ))
}

async fn purge_secret(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(path): Path<String>,
) -> Result<StatusCode, AppError> {
    state.secret_store.purge(principal.as_str(), &path).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_root(State(state): State<Arc<AppState>>) -> Result<Json<ListResponse>, AppError> {
    Ok(Json(ListResponse {
        keys: state.secret_store.list("").await?,
    }))
}

async fn list_secrets(
    State(state): State<Arc<AppState>>,
    Path(prefix): Path<String>,
) -> Result<Json<ListResponse>, AppError> {
    Ok(Json(ListResponse {
        keys: state.secret_store.list(&prefix).await?,
    }))
}
