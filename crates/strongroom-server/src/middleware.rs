//! Principal extraction for `Strongroom`.
//!
//! Authentication happens in front of this server. The fronting layer passes
//! the authenticated identity in `X-Strongroom-Principal`; it becomes the
//! actor on every audit event. Requests without it are refused, except the
//! health and seal-status probes.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::AppError;

/// Header carrying the authenticated principal.
pub const PRINCIPAL_HEADER: &str = "x-strongroom-principal";

/// The caller's identity, inserted into request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

impl Principal {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Paths reachable without a principal.
fn is_public(path: &str) -> bool {
    matches!(path, "/v1/sys/health" | "/v1/sys/seal-status")
}

/// Require `X-Strongroom-Principal` and expose it as [`Principal`].
pub async fn principal_middleware(mut req: Request, next: Next) -> Response {
    if is_public(req.uri().path()) {
        return next.run(req).await;
    }

    let principal = req
        .headers()
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned);

    match principal {
        Some(principal) => {
            req.extensions_mut().insert(Principal(principal));
            next.run(req).await
        }
        None => AppError::Unauthorized(format!("missing {PRINCIPAL_HEADER} header")).into_response(),
    }
}
