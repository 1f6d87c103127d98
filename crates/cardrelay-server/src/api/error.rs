//! API error types and response handling.
//!
//! Every handler returns [`ApiResult`]; errors render as an
//! [`ErrorResponse`] with a status derived from the core error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cardrelay_core::CardRelayError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - the activation was rejected.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - no such scan, or nothing to cancel.
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - another scan owns the reader.
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// The scan currently running, if known.
        active_scan_id: Option<String>,
    },

    /// 500 Internal Server Error - unexpected server-side error.
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional details.
        details: Option<String>,
    },

    /// 503 Service Unavailable - the card reader cannot be used.
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "missing_field",
    "message": "Activation is missing required parameter 'scan_id'",
    "details": null
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "session_active").
    #[schema(example = "missing_field")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "Activation is missing required parameter 'scan_id'")]
    pub message: String,

    /// Optional additional details.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match self {
            Self::BadRequest { error_code, message } => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: None,
                },
            ),

            Self::NotFound { error_code, message } => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: None,
                },
            ),

            Self::Conflict {
                error_code,
                message,
                active_scan_id,
            } => (
                StatusCode::CONFLICT,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: active_scan_id
                        .map(|scan_id| serde_json::json!({ "active_scan_id": scan_id })),
                },
            ),

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

                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: error_code,
                        message,
                        details: details.map(|d| serde_json::json!(d)),
                    },
                )
            }

            Self::ServiceUnavailable {
                error_code,
                message,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: None,
                },
            ),
        };

        (status, Json(error_response)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::NotFound { message, .. } => write!(f, "Not Found: {message}"),
            Self::Conflict { message, .. } => write!(f, "Conflict: {message}"),
            Self::InternalError { message, .. } => write!(f, "Internal Error: {message}"),
            Self::ServiceUnavailable { message, .. } => {
                write!(f, "Service Unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

/// Convert from core errors, keyed on their HTTP classification.
impl From<CardRelayError> for ApiError {
    fn from(err: CardRelayError) -> Self {
        let error_code = err.error_code().to_ascii_lowercase();
        let message = err.to_string();

        match err.http_status_code() {
            400 => Self::BadRequest {
                error_code,
                message,
            },
            409 => Self::Conflict {
                error_code,
                message,
                active_scan_id: None,
            },
            503 => Self::ServiceUnavailable {
                error_code,
                message,
            },
            _ => Self::InternalError {
                error_code,
                message,
                details: None,
            },
        }
    }
}

impl ApiError {
    /// 404 for a scan id the server does not know.
    pub fn scan_not_found(scan_id: &str) -> Self {
        Self::NotFound {
            error_code: "scan_not_found".to_string(),
            message: format!("No result recorded for scan '{scan_id}'"),
        }
    }

    /// 404 when there is nothing to cancel.
    pub fn no_active_session() -> Self {
        Self::NotFound {
            error_code: "no_active_session".to_string(),
            message: "No scan session is active".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardrelay_core::{ActivationError, SessionError};

    #[test]
    fn test_missing_field_is_bad_request() {
        let err: ApiError =
            CardRelayError::from(ActivationError::MissingField { field: "scan_id" }).into();
        match err {
            ApiError::BadRequest { error_code, message } => {
                assert_eq!(error_code, "missing_field");
                assert!(message.contains("scan_id"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_active_session_is_conflict() {
        let err: ApiError = CardRelayError::from(SessionError::AlreadyActive).into();
        assert!(matches!(
            err,
            ApiError::Conflict { ref error_code, .. } if error_code == "session_active"
        ));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_not_found_helpers() {
        let response = ApiError::scan_not_found("abc123").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(ApiError::no_active_session().to_string().contains("Not Found"));
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            error: "session_active".to_string(),
            message: "busy".to_string(),
            details: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("session_active"));
    }
}
