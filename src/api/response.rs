use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

// ============================================================================
// Error envelope: {"error":{"message":"...","code":"..."}}
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
}

// ============================================================================
// Unified error type for handlers and middleware
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorEnvelope {
                error: ErrorBody {
                    message: self.message,
                    code: self.code.to_string(),
                },
            }),
        )
            .into_response()
    }
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// A required identifier is absent. The status depends on which one.
    pub fn required(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status, "required", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PRECONDITION_FAILED, "not_found", message)
    }

    pub fn permission_denied() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "permission_denied",
            "no permission to access endpoint with given TURBO_TOKEN",
        )
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}
