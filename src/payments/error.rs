use crate::database::error::DatabaseError;
use serde::Serialize;
use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

/// Why a caller-supplied field was rejected before anything reached the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationReason {
    InvalidPhoneNumber,
    InvalidAmount,
    AmountOutOfRange,
    InvalidReference,
    MissingField,
}

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        reason: ValidationReason,
        field: String,
        message: String,
    },

    #[error("Authentication with payment gateway failed: {message}")]
    AuthenticationFailure { message: String },

    #[error("Gateway timeout: {operation} exceeded {timeout_secs}s")]
    GatewayTimeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("Gateway rejected request: {description}")]
    GatewayRejected {
        code: Option<String>,
        description: String,
    },

    #[error("Gateway unavailable: {message}")]
    GatewayUnavailable { message: String },

    #[error("Malformed callback: {message}")]
    StructuralCallbackError { message: String },

    #[error("Transaction not found: {reference}")]
    NotFound { reference: String },

    #[error("Storage error: {0}")]
    Storage(DatabaseError),

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },
}

impl PaymentError {
    pub fn validation(
        reason: ValidationReason,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        PaymentError::ValidationError {
            reason,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::AuthenticationFailure { .. } => false,
            PaymentError::GatewayTimeout { .. } => true,
            PaymentError::GatewayRejected { .. } => false,
            PaymentError::GatewayUnavailable { .. } => true,
            PaymentError::StructuralCallbackError { .. } => false,
            PaymentError::NotFound { .. } => false,
            PaymentError::Storage(err) => err.is_retryable(),
            PaymentError::ConfigurationError { .. } => false,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::AuthenticationFailure { .. } => 502,
            PaymentError::GatewayTimeout { .. } => 504,
            PaymentError::GatewayRejected { .. } => 502,
            PaymentError::GatewayUnavailable { .. } => 503,
            PaymentError::StructuralCallbackError { .. } => 400,
            PaymentError::NotFound { .. } => 404,
            PaymentError::Storage(_) => 500,
            PaymentError::ConfigurationError { .. } => 500,
        }
    }

    /// Machine-readable code for API clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            PaymentError::ValidationError { reason, .. } => match reason {
                ValidationReason::InvalidPhoneNumber => "INVALID_PHONE_NUMBER",
                ValidationReason::InvalidAmount => "INVALID_AMOUNT",
                ValidationReason::AmountOutOfRange => "AMOUNT_OUT_OF_RANGE",
                ValidationReason::InvalidReference => "INVALID_REFERENCE",
                ValidationReason::MissingField => "MISSING_FIELD",
            },
            PaymentError::AuthenticationFailure { .. } => "AUTHENTICATION_FAILURE",
            PaymentError::GatewayTimeout { .. } => "GATEWAY_TIMEOUT",
            PaymentError::GatewayRejected { .. } => "GATEWAY_REJECTED",
            PaymentError::GatewayUnavailable { .. } => "GATEWAY_UNAVAILABLE",
            PaymentError::StructuralCallbackError { .. } => "INVALID_CALLBACK",
            PaymentError::NotFound { .. } => "TRANSACTION_NOT_FOUND",
            PaymentError::Storage(_) => "DATABASE_ERROR",
            PaymentError::ConfigurationError { .. } => "CONFIGURATION_ERROR",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::AuthenticationFailure { .. } => {
                "Failed to authenticate with the payment gateway".to_string()
            }
            PaymentError::GatewayTimeout { .. } => {
                "Payment gateway did not respond in time. Please retry".to_string()
            }
            PaymentError::GatewayRejected { description, .. } => description.clone(),
            PaymentError::GatewayUnavailable { .. } => {
                "Payment gateway is temporarily unavailable".to_string()
            }
            PaymentError::StructuralCallbackError { .. } => {
                "Invalid callback structure".to_string()
            }
            PaymentError::NotFound { .. } => "Transaction not found".to_string(),
            PaymentError::Storage(_) => "A storage error occurred. Please retry".to_string(),
            PaymentError::ConfigurationError { .. } => {
                "Payment service is misconfigured".to_string()
            }
        }
    }
}

impl From<DatabaseError> for PaymentError {
    fn from(err: DatabaseError) -> Self {
        PaymentError::Storage(err)
    }
}
