use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::db::StoreError;
use crate::execution::position_sizer::SizingError;

// ---------------------------------------------------------------------------
// Pipeline errors
// ---------------------------------------------------------------------------

/// Failure classes every stage reports in.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Network, timeout or rate limit. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// The venue refused the order; another venue may accept it.
    #[error("venue rejected order: {0}")]
    VenueRejected(String),

    /// Failure specific to one user, e.g. insufficient balance.
    #[error("user permanent: {0}")]
    UserPermanent(String),

    #[error("integrity: {0}")]
    Integrity(String),

    /// Outcome unknown; only reconciliation may resolve it.
    #[error("ambiguous: {0}")]
    Ambiguous(String),

    #[error(transparent)]
    Sizing(#[from] SizingError),

    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional update lost a race or the record is in the wrong state.
    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Fatal errors abort the current worker cycle and degrade health.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Fatal(_) => true,
            PipelineError::Store(e) => e.is_unavailable(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".into()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };

        (
            status,
            Json(ErrorBody {
                success: false,
                error: message,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UniqueViolation(msg) => AppError::Conflict(msg),
            StoreError::Unavailable(msg) => AppError::Unavailable(msg),
            other => AppError::Internal(other.into()),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::NotFound(msg) => AppError::NotFound(msg),
            PipelineError::StateConflict(msg) => AppError::Conflict(msg),
            PipelineError::Integrity(msg) | PipelineError::UserPermanent(msg) => {
                AppError::Unprocessable(msg)
            }
            PipelineError::Sizing(e) => AppError::Unprocessable(e.to_string()),
            PipelineError::Store(e) => e.into(),
            other => AppError::Internal(other.into()),
        }
    }
}
