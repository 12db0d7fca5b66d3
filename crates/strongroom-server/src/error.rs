//! HTTP error mapping for `Strongroom` server.
//!
//! Core errors carry an [`ErrorKind`]; the kind picks the status code and
//! becomes the machine-readable `error` field of the JSON body. Storage and
//! internal failures are logged and answered with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use strongroom_core::ErrorKind;
use strongroom_core::error::{LeaseError, SealError, SecretError};

/// Error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// No principal was supplied by the fronting auth layer.
    Unauthorized(String),
    /// The request could not be understood.
    BadRequest(String),
    /// A core operation failed.
    Core { kind: ErrorKind, message: String },
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// Status code for a core failure class.
#[must_use]
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Sealed => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::SecretNotFound | ErrorKind::LeaseNotFound => StatusCode::NOT_FOUND,
        ErrorKind::VersionDestroyed => StatusCode::GONE,
        ErrorKind::AlreadyInitialized | ErrorKind::CasConflict | ErrorKind::Contention => {
            StatusCode::CONFLICT
        }
        ErrorKind::NotInitialized
        | ErrorKind::InvalidThreshold
        | ErrorKind::InvalidShareFormat
        | ErrorKind::DuplicateUnsealKey
        | ErrorKind::MasterKeyVerificationFailed
        | ErrorKind::LeaseNotRenewable
        | ErrorKind::LeaseRenewalLimitExceeded
        | ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Storage | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Core { kind, message } => {
                let status = status_for(kind);
                if status.is_server_error() && kind != ErrorKind::Sealed {
                    error!(kind = %kind, error = %message, "request failed");
                    (status, kind.as_str(), "internal error".to_owned())
                } else {
                    (status, kind.as_str(), message)
                }
            }
        };

        (
            status,
            axum::Json(ErrorBody {
                error: error_type,
                message,
            }),
        )
            .into_response()
    }
}

macro_rules! from_core_error {
    ($($ty:ty),+) => {$(
        impl From<$ty> for AppError {
            fn from(err: $ty) -> Self {
                Self::Core {
                    kind: err.kind(),
                    message: err.to_string(),
                }
            }
        }
    )+};
}

from_core_error!(SealError, SecretError, LeaseError);
