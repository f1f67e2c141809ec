use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::stk_transaction_repository::StkTransaction;
use crate::payments::error::{PaymentError, PaymentResult, ValidationReason};
use crate::services::reconciliation::{CallbackAck, PollResult, ReconciliationCoordinator};
use crate::services::stk_push::{InitiationResult, PaymentIntent, StkPushService};

#[derive(Clone)]
pub struct MpesaState {
    pub stk_push: StkPushService,
    pub coordinator: ReconciliationCoordinator,
}

/// Initiation body. `amount` may be a JSON number or a numeric string.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StkPushBody {
    pub phone_number: Option<String>,
    pub amount: Option<JsonValue>,
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StkQueryBody {
    pub checkout_request_id: Option<String>,
}

pub fn mpesa_routes(state: MpesaState) -> Router {
    Router::new()
        .route("/api/mpesa/stkpush", post(initiate_stk_push))
        .route("/api/mpesa/callback", post(handle_callback))
        .route("/api/mpesa/stkquery", post(query_stk_status))
        .route("/api/mpesa/transactions/{id}", get(get_transaction))
        .route(
            "/api/mpesa/transactions/checkout/{checkout_request_id}",
            get(get_transaction_by_checkout_id),
        )
        .with_state(state)
}

/// POST /api/mpesa/stkpush
pub async fn initiate_stk_push(
    State(state): State<MpesaState>,
    body: Result<Json<StkPushBody>, JsonRejection>,
) -> PaymentResult<Json<InitiationResult>> {
    let Json(body) = body.map_err(|e| malformed_body(e, "body"))?;

    let subscriber_address = required(body.phone_number, "phoneNumber")?;
    let amount_raw = match body.amount {
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::String(s)) if !s.trim().is_empty() => s,
        Some(JsonValue::Null) | None => return Err(missing("amount")),
        Some(_) => {
            return Err(PaymentError::validation(
                ValidationReason::InvalidAmount,
                "amount",
                "Amount must be a valid number",
            ))
        }
    };

    let result = state
        .stk_push
        .initiate(&PaymentIntent {
            subscriber_address,
            amount_raw,
            reference: body.reference,
        })
        .await?;

    Ok(Json(result))
}

/// POST /api/mpesa/callback
///
/// The envelope is taken as raw JSON so the original payload can be kept
/// on the record.
pub async fn handle_callback(
    State(state): State<MpesaState>,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> PaymentResult<Json<CallbackAck>> {
    let Json(payload) = body.map_err(|e| {
        warn!(error = %e, "callback body is not valid JSON");
        PaymentError::StructuralCallbackError {
            message: e.body_text(),
        }
    })?;

    let ack = state.coordinator.handle_callback(&payload).await?;
    info!(
        transaction_id = %ack.transaction_id,
        status = %ack.status,
        "callback processed"
    );
    Ok(Json(ack))
}

/// POST /api/mpesa/stkquery
pub async fn query_stk_status(
    State(state): State<MpesaState>,
    body: Result<Json<StkQueryBody>, JsonRejection>,
) -> PaymentResult<Json<PollResult>> {
    let Json(body) = body.map_err(|e| malformed_body(e, "body"))?;
    let checkout_request_id = required(body.checkout_request_id, "checkoutRequestId")?;

    let result = state.coordinator.poll_status(&checkout_request_id).await?;
    Ok(Json(result))
}

/// GET /api/mpesa/transactions/{id}
pub async fn get_transaction(
    State(state): State<MpesaState>,
    Path(id): Path<String>,
) -> PaymentResult<Json<StkTransaction>> {
    let id = Uuid::parse_str(&id).map_err(|_| PaymentError::NotFound { reference: id })?;
    Ok(Json(state.stk_push.find_by_id(id).await?))
}

/// GET /api/mpesa/transactions/checkout/{checkout_request_id}
pub async fn get_transaction_by_checkout_id(
    State(state): State<MpesaState>,
    Path(checkout_request_id): Path<String>,
) -> PaymentResult<Json<StkTransaction>> {
    Ok(Json(
        state
            .stk_push
            .find_by_checkout_request_id(&checkout_request_id)
            .await?,
    ))
}

fn required(value: Option<String>, field: &str) -> PaymentResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| missing(field))
}

fn missing(field: &str) -> PaymentError {
    PaymentError::validation(
        ValidationReason::MissingField,
        field,
        format!("{} is required", field),
    )
}

fn malformed_body(rejection: JsonRejection, field: &str) -> PaymentError {
    PaymentError::validation(ValidationReason::MissingField, field, rejection.body_text())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_values_count_as_missing() {
        assert!(required(Some("  ".to_string()), "phoneNumber").is_err());
        assert!(required(None, "phoneNumber").is_err());
        assert_eq!(
            required(Some("0712345678".to_string()), "phoneNumber").unwrap(),
            "0712345678"
        );
    }

    #[test]
    fn push_body_accepts_numeric_or_string_amount() {
        let body: StkPushBody = serde_json::from_value(serde_json::json!({
            "phoneNumber": "0712345678",
            "amount": 70000,
            "reference": "BuyGoods"
        }))
        .unwrap();
        assert_eq!(body.amount, Some(serde_json::json!(70000)));

        let body: StkPushBody = serde_json::from_value(serde_json::json!({
            "phoneNumber": "0712345678",
            "amount": "10.5"
        }))
        .unwrap();
        assert_eq!(body.amount, Some(serde_json::json!("10.5")));
        assert!(body.reference.is_none());
    }
}
