//! HTTP route handlers for `Strongroom`.
//!
//! - `sys`: initialize, seal, unseal, status, health
//! - `secrets`: versioned secret CRUD under `/v1/secret`
//! - `leases`: lease lifecycle under `/v1/sys/leases`

pub mod leases;
pub mod secrets;
pub mod sys;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderValue, header};
use axum::middleware as axum_mw;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::principal_middleware;
use crate::state::AppState;

/// Build the full router with middleware.
pub fn app(state: Arc<AppState>) -> Router {
    // Limit concurrent seal operations; unseal attempts serialize anyway.
    let sys_routes = Router::new()
        .nest("/v1/sys", sys::router())
        .layer(tower::limit::ConcurrencyLimitLayer::new(10));

    Router::new()
        .merge(sys_routes)
        .nest("/v1/sys/leases", leases::router())
        .nest("/v1/secret", secrets::router())
        .route_layer(axum_mw::from_fn(principal_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}
