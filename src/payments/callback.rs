//! Boundary parser for the gateway's asynchronous result callback.
//!
//! The free-form `CallbackMetadata.Item` list is turned into a typed
//! [`CallbackMetadata`] here, so nothing downstream searches name/value pairs.

use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::request_builder::gateway_offset;
use crate::payments::types::{CallbackMetadata, GatewayResult, ResultCode};
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    #[serde(rename = "Body")]
    body: CallbackBody,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: RawStkCallback,
}

#[derive(Debug, Deserialize)]
struct RawStkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    result_code: ResultCode,
    #[serde(rename = "ResultDesc", default)]
    result_desc: String,
    #[serde(rename = "CallbackMetadata", default)]
    callback_metadata: Option<RawMetadata>,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
struct MetadataItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value", default)]
    value: Option<JsonValue>,
}

/// Metadata names the gateway sends on a successful payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetadataField {
    Amount,
    ReceiptNumber,
    TransactionDate,
    PhoneNumber,
    Balance,
}

impl MetadataField {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Amount" => Some(MetadataField::Amount),
            "MpesaReceiptNumber" => Some(MetadataField::ReceiptNumber),
            "TransactionDate" => Some(MetadataField::TransactionDate),
            "PhoneNumber" => Some(MetadataField::PhoneNumber),
            "Balance" => Some(MetadataField::Balance),
            _ => None,
        }
    }
}

/// A structurally valid callback.
#[derive(Debug, Clone)]
pub struct StkCallback {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub result_code: ResultCode,
    pub result_description: String,
    /// Present only when the result code is the success sentinel.
    pub metadata: Option<CallbackMetadata>,
}

impl StkCallback {
    pub fn from_payload(payload: &JsonValue) -> PaymentResult<Self> {
        if payload.pointer("/Body/stkCallback").is_none() {
            return Err(PaymentError::StructuralCallbackError {
                message: "missing Body.stkCallback".to_string(),
            });
        }

        let envelope = CallbackEnvelope::deserialize(payload).map_err(|e| {
            PaymentError::StructuralCallbackError {
                message: format!("invalid stkCallback: {}", e),
            }
        })?;
        let raw = envelope.body.stk_callback;

        let checkout_request_id = raw.checkout_request_id.trim().to_string();
        if checkout_request_id.is_empty() {
            return Err(PaymentError::StructuralCallbackError {
                message: "empty CheckoutRequestID".to_string(),
            });
        }

        let metadata = if raw.result_code.is_success() {
            raw.callback_metadata
                .map(|m| parse_metadata(&m.items))
                .filter(|m| !m.is_empty())
        } else {
            None
        };

        Ok(Self {
            merchant_request_id: raw.merchant_request_id,
            checkout_request_id,
            result_code: raw.result_code,
            result_description: raw.result_desc,
            metadata,
        })
    }

    pub fn into_result(self) -> (String, GatewayResult) {
        (
            self.checkout_request_id,
            GatewayResult {
                result_code: self.result_code,
                result_description: self.result_description,
                metadata: self.metadata,
            },
        )
    }
}

fn parse_metadata(items: &[MetadataItem]) -> CallbackMetadata {
    let mut metadata = CallbackMetadata::default();

    for item in items {
        let (Some(field), Some(value)) = (MetadataField::from_name(&item.name), &item.value)
        else {
            continue;
        };
        match field {
            MetadataField::Amount => metadata.amount_minor_units = amount_value(value),
            MetadataField::ReceiptNumber => metadata.receipt_number = text_value(value),
            MetadataField::PhoneNumber => metadata.subscriber_address = text_value(value),
            MetadataField::TransactionDate => {
                metadata.transaction_timestamp = text_value(value).and_then(|v| parse_gateway_date(&v))
            }
            MetadataField::Balance => {}
        }
    }

    metadata
}

fn text_value(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn amount_value(value: &JsonValue) -> Option<i64> {
    let decimal = match value {
        JsonValue::Number(n) => match n.as_i64() {
            Some(whole) => return Some(whole),
            None => Decimal::from_str(&n.to_string()).ok()?,
        },
        JsonValue::String(s) => Decimal::from_str(s.trim()).ok()?,
        _ => return None,
    };
    decimal
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// `YYYYMMDDHHmmss` in gateway local time.
fn parse_gateway_date(raw: &str) -> Option<DateTime<Utc>> {
    let parsed = NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S")
        .ok()
        .and_then(|naive| naive.and_local_timezone(gateway_offset()).single())
        .map(|local| local.with_timezone(&Utc));
    if parsed.is_none() {
        debug!(value = raw, "unparseable TransactionDate in callback metadata");
    }
    parsed
}
