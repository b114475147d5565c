//! API error types and response handling.
//!
//! Every handler error converts into [`ApiError`], which renders as a JSON
//! [`ErrorResponse`] with the matching HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use irkfinder_core::{BondStoreError, IrkError};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// 500 Internal Server Error - Unexpected server-side error.
    #[error("Internal Error: {message}")]
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional additional details.
        details: Option<String>,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "reset_failed",
    "message": "Failed to remove bonded devices",
    "details": "BOND_REMOVAL_FAILED"
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "reset_failed").
    #[schema(example = "reset_failed")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "Failed to remove bonded devices")]
    pub message: String,

    /// Optional additional details for debugging.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// The reset endpoint's failure: the session was cleared but the bond
    /// store could not be emptied.
    pub fn reset_failed(err: BondStoreError) -> Self {
        let cause = IrkError::from(err);
        Self::InternalError {
            error_code: "reset_failed".to_string(),
            message: format!("Failed to remove bonded devices: {cause}"),
            details: Some(cause.error_code().to_string()),
        }
    }

    const fn status(&self) -> StatusCode {
        match self {
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::InternalError {
                error_code,
                message,
                details,
            } => {
                tracing::error!(
                    error_code = %error_code,
                    message = %message,
                    details = ?details,
                    "Internal server error"
                );
                ErrorResponse {
                    error: error_code,
                    message,
                    details: details.map(serde_json::Value::String),
                }
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use irkfinder_core::Address;

    #[test]
    fn test_internal_error_display() {
        let err = ApiError::InternalError {
            error_code: "reset_failed".to_string(),
            message: "Reset task failed".to_string(),
            details: None,
        };
        assert!(err.to_string().contains("Internal Error"));
    }

    #[test]
    fn test_reset_failed_when_store_unavailable() {
        let ApiError::InternalError {
            error_code,
            message,
            details,
        } = ApiError::reset_failed(BondStoreError::Unavailable("gone".into()));
        assert_eq!(error_code, "reset_failed");
        assert!(message.contains("gone"));
        assert_eq!(details.as_deref(), Some("BOND_STORE_UNAVAILABLE"));
    }

    #[test]
    fn test_reset_failed_is_internal() {
        let err = ApiError::reset_failed(BondStoreError::RemoveFailed {
            address: Address::new([0x5C, 0x11, 0x22, 0x33, 0x44, 0x55]),
            message: "busy".into(),
        });
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let ApiError::InternalError { details, .. } = err;
        assert_eq!(details.as_deref(), Some("BOND_REMOVAL_FAILED"));
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            error: "test_error".to_string(),
            message: "Test message".to_string(),
            details: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test_error"));
    }
}
