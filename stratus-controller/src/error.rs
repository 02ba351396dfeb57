//! Standardized error handling for API responses
//!
//! Provides consistent JSON error responses across all API endpoints

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Standard API error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub status: u16,

    /// Error code for programmatic handling
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Optional detailed error information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Timestamp when error occurred
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(status: u16, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// API error types with standardized responses
#[derive(Debug)]
pub enum ApiError {
    /// 500 Internal Server Error
    Internal(String),

    /// 404 Not Found
    NotFound(String),

    /// 401 Unauthorized
    AuthenticationFailed,

    /// 400 Bad Request
    BadRequest(String),

    /// 409 Conflict
    Conflict(String),

    /// 422 Unprocessable Entity
    ValidationError(String),

    /// 503 Service Unavailable
    ServiceUnavailable(String),
}

impl ApiError {
    /// Convert error to ErrorResponse
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            ApiError::Internal(msg) => {
                error!("Internal API error: {}", msg);
                ErrorResponse::new(500, "INTERNAL_ERROR", "An internal server error occurred")
                    .with_details(msg)
            }
            ApiError::NotFound(msg) => ErrorResponse::new(404, "NOT_FOUND", msg),
            ApiError::AuthenticationFailed => ErrorResponse::new(
                401,
                "AUTHENTICATION_FAILED",
                "Authentication credentials are invalid or missing",
            ),
            ApiError::BadRequest(msg) => ErrorResponse::new(400, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => ErrorResponse::new(409, "CONFLICT", msg),
            ApiError::ValidationError(msg) => ErrorResponse::new(422, "VALIDATION_ERROR", msg),
            ApiError::ServiceUnavailable(msg) => {
                ErrorResponse::new(503, "SERVICE_UNAVAILABLE", msg)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_response = self.to_error_response();
        let status_code = StatusCode::from_u16(error_response.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        (status_code, Json(error_response)).into_response()
    }
}

impl From<stratus_common::Error> for ApiError {
    fn from(err: stratus_common::Error) -> Self {
        match err {
            stratus_common::Error::VmNotFound(id) => {
                ApiError::NotFound(format!("Virtual machine '{}' not found", id))
            }
            stratus_common::Error::HostNotFound(id) => {
                ApiError::BadRequest(format!("Host '{}' is not known to the controller", id))
            }
            stratus_common::Error::MigrationNotFound(id) => {
                ApiError::NotFound(format!("Migration '{}' not found", id))
            }
            stratus_common::Error::MigrationExists { vm_id, existing } => ApiError::Conflict(
                format!("VM '{}' already has migration '{}' in flight", vm_id, existing),
            ),
            stratus_common::Error::InvalidTransition { from, to } => {
                ApiError::Conflict(format!("Migration cannot move from {} to {}", from, to))
            }
            stratus_common::Error::LockTimeout(key) => {
                ApiError::ServiceUnavailable(format!("Could not acquire {}", key))
            }
            stratus_common::Error::Validation(msg) => ApiError::ValidationError(msg),
            stratus_common::Error::Driver(msg) => ApiError::Internal(msg),
            stratus_common::Error::System(msg) => ApiError::Internal(msg),
            stratus_common::Error::Io(e) => ApiError::Internal(format!("I/O error: {}", e)),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(format!("Invalid JSON: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_creation() {
        let error = ErrorResponse::new(404, "NOT_FOUND", "Resource not found");
        assert_eq!(error.status, 404);
        assert_eq!(error.error, "NOT_FOUND");
        assert_eq!(error.message, "Resource not found");
        assert!(error.details.is_none());
    }

    #[test]
    fn test_common_error_conversion() {
        let err = stratus_common::Error::MigrationNotFound("m-1".to_string());
        let api_err: ApiError = err.into();
        assert_eq!(api_err.to_error_response().status, 404);

        let err = stratus_common::Error::InvalidTransition {
            from: stratus_common::MigrationStatus::Completed,
            to: stratus_common::MigrationStatus::Cancelled,
        };
        let api_err: ApiError = err.into();
        assert_eq!(api_err.to_error_response().status, 409);

        let err = stratus_common::Error::Validation("source and target match".to_string());
        let api_err: ApiError = err.into();
        assert_eq!(api_err.to_error_response().status, 422);
    }

    #[test]
    fn test_json_serialization() {
        let error = ErrorResponse::new(400, "BAD_REQUEST", "Invalid input");
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("BAD_REQUEST"));
        assert!(json.contains("Invalid input"));
    }
}
