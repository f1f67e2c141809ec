use crate::payments::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Literal the gateway uses for "accepted" / "paid" in both `ResponseCode` and `ResultCode`.
pub const SUCCESS_CODE: &str = "0";

/// Gateway result code, kept opaque.
///
/// Callbacks carry it as a JSON number while the status query returns a
/// string, so both shapes deserialize into the same textual form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ResultCode(String);

impl ResultCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_string())
    }

    pub fn success() -> Self {
        Self(SUCCESS_CODE.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.0 == SUCCESS_CODE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ResultCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Int(code) => ResultCode(code.to_string()),
            Raw::Text(code) => ResultCode::new(code),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Status a pending transaction moves to for a definitive gateway result.
    pub fn from_result_code(code: &ResultCode) -> Self {
        if code.is_success() {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Failed
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            _ => Err(PaymentError::ConfigurationError {
                message: format!("unknown transaction status: {}", value),
            }),
        }
    }
}

/// Which reconciliation path delivered a result.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationSource {
    Callback,
    Poll,
}

impl fmt::Display for ReconciliationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconciliationSource::Callback => f.write_str("callback"),
            ReconciliationSource::Poll => f.write_str("poll"),
        }
    }
}

/// Timestamp plus password pair the gateway requires on push and query calls.
#[derive(Clone, PartialEq, Eq)]
pub struct RequestSignature {
    pub timestamp: String,
    pub password: String,
}

impl fmt::Debug for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSignature")
            .field("timestamp", &self.timestamp)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A validated push request, ready for dispatch. Never persisted.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub subscriber_address: String,
    pub amount_minor_units: i64,
    pub account_reference: String,
    pub description: String,
    pub signature: RequestSignature,
}

/// Gateway acknowledgement of a push request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAcknowledgement {
    pub accepted: bool,
    pub response_code: String,
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct StatusQueryResult {
    pub result_code: ResultCode,
    pub result_description: String,
}

/// Typed view of the callback's `CallbackMetadata.Item` list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackMetadata {
    pub receipt_number: Option<String>,
    pub amount_minor_units: Option<i64>,
    pub subscriber_address: Option<String>,
    pub transaction_timestamp: Option<DateTime<Utc>>,
}

impl CallbackMetadata {
    pub fn is_empty(&self) -> bool {
        self.receipt_number.is_none()
            && self.amount_minor_units.is_none()
            && self.subscriber_address.is_none()
            && self.transaction_timestamp.is_none()
    }
}

/// A definitive result delivered by either reconciliation path.
#[derive(Debug, Clone)]
pub struct GatewayResult {
    pub result_code: ResultCode,
    pub result_description: String,
    pub metadata: Option<CallbackMetadata>,
}

impl From<StatusQueryResult> for GatewayResult {
    fn from(result: StatusQueryResult) -> Self {
        Self {
            result_code: result.result_code,
            result_description: result.result_description,
            metadata: None,
        }
    }
}
