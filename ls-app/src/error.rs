//! HTTP error envelope.
//!
//! Every handler returns `Result<_, ApiError>`; the `IntoResponse` impl maps
//! each variant to a status code and a `{"error", "message"}` JSON body.
//! Provider failures are converted through `LlmError::public_message`, so
//! upstream error bodies never reach the caller.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ls_llm::LlmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Store(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Validation(_) => "validation_error",
            ApiError::Store(_) => "storage_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// Caller-facing message. Storage and internal failures keep their detail
    /// in logs only.
    fn message(&self) -> String {
        match self {
            ApiError::Store(_) => "Unable to persist data. Please try again.".to_string(),
            ApiError::Internal(_) => "Internal server error.".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.message(),
        }));
        (status, body).into_response()
    }
}

impl From<LlmError> for ApiError {
    fn from(e: LlmError) -> Self {
        // Full detail to the log, public message to the caller.
        tracing::warn!(error = %e, "llm call failed");
        match e {
            LlmError::InvalidInput(msg) => ApiError::Validation(msg),
            LlmError::Gateway(_) => ApiError::Internal(e.to_string()),
            other => ApiError::BadRequest(other.public_message()),
        }
    }
}
