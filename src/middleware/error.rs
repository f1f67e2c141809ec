//! Error response formatting middleware
//!
//! Provides standardized error responses with consistent JSON structure,
//! HTTP status codes, error codes, and user-friendly messages.

use crate::payments::error::PaymentError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Standardized error response structure
///
/// This is returned to clients for all error cases, ensuring
/// consistent error handling across the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details (e.g., the rejected field)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Whether the client should retry the request
    pub retryable: bool,

    /// ISO 8601 timestamp of the error
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn from_payment_error(error: &PaymentError) -> Self {
        let details = match error {
            PaymentError::ValidationError { reason, field, .. } => Some(serde_json::json!({
                "field": field,
                "reason": reason,
            })),
            PaymentError::GatewayRejected {
                code: Some(code), ..
            } => Some(serde_json::json!({ "gatewayCode": code })),
            PaymentError::GatewayTimeout {
                operation,
                timeout_secs,
            } => Some(serde_json::json!({
                "operation": operation,
                "timeoutSecs": timeout_secs,
            })),
            _ => None,
        };

        Self {
            error: error.error_code().to_string(),
            message: error.user_message(),
            details,
            retryable: error.is_retryable(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Convert payment errors into HTTP responses with proper status codes and JSON formatting
impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let status_code = StatusCode::from_u16(self.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status_code.is_server_error() {
            tracing::error!(
                error = %self,
                status = %status_code.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = %self,
                status = %status_code.as_u16(),
                "Client error occurred"
            );
        }

        let error_response = ErrorResponse::from_payment_error(&self);
        (status_code, Json(error_response)).into_response()
    }
}
