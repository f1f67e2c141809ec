//! STK push initiation
//!
//! Validates the caller's intent, dispatches a signed push request and
//! records a pending transaction once the gateway has accepted it. A push
//! the gateway refuses never produces a stored record.

use crate::database::repository::TransactionStore;
use crate::database::stk_transaction_repository::{NewStkTransaction, StkTransaction};
use crate::logging::mask_phone_number;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::StkPushGateway;
use crate::payments::request_builder::StkPushBuilder;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Parsed initiation request from the HTTP layer.
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub subscriber_address: String,
    pub amount_raw: String,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiationResult {
    pub accepted: bool,
    pub transaction_id: Uuid,
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub description: String,
}

#[derive(Clone)]
pub struct StkPushService {
    builder: StkPushBuilder,
    gateway: Arc<dyn StkPushGateway>,
    store: Arc<dyn TransactionStore>,
}

impl StkPushService {
    pub fn new(
        builder: StkPushBuilder,
        gateway: Arc<dyn StkPushGateway>,
        store: Arc<dyn TransactionStore>,
    ) -> Self {
        Self {
            builder,
            gateway,
            store,
        }
    }

    pub async fn initiate(&self, intent: &PaymentIntent) -> PaymentResult<InitiationResult> {
        let request = self.builder.build(
            &intent.subscriber_address,
            &intent.amount_raw,
            intent.reference.as_deref(),
        )?;

        info!(
            subscriber = %mask_phone_number(&request.subscriber_address),
            amount = request.amount_minor_units,
            account_reference = %request.account_reference,
            "initiating stk push"
        );

        let ack = self.gateway.initiate_push(&request).await?;
        if !ack.accepted {
            return Err(PaymentError::GatewayRejected {
                code: Some(ack.response_code),
                description: ack.description,
            });
        }
        if ack.checkout_request_id.trim().is_empty() {
            warn!(
                merchant_request_id = %ack.merchant_request_id,
                "accepted push carried no CheckoutRequestID"
            );
            return Err(PaymentError::GatewayUnavailable {
                message: "gateway accepted push without a CheckoutRequestID".to_string(),
            });
        }

        let transaction = self
            .store
            .insert_pending(NewStkTransaction {
                subscriber_address: request.subscriber_address,
                amount_minor_units: request.amount_minor_units,
                account_reference: request.account_reference,
                merchant_request_id: ack.merchant_request_id.clone(),
                checkout_request_id: ack.checkout_request_id.clone(),
            })
            .await
            .inspect_err(|e| {
                // the push is live at the gateway but untracked locally
                error!(
                    checkout_request_id = %ack.checkout_request_id,
                    error = %e,
                    "failed to record accepted stk push"
                );
            })?;

        info!(
            transaction_id = %transaction.id,
            checkout_request_id = %transaction.checkout_request_id,
            "stk push recorded as pending"
        );

        Ok(InitiationResult {
            accepted: true,
            transaction_id: transaction.id,
            checkout_request_id: ack.checkout_request_id,
            merchant_request_id: ack.merchant_request_id,
            description: ack.description,
        })
    }

    pub async fn find_by_id(&self, id: Uuid) -> PaymentResult<StkTransaction> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound {
                reference: id.to_string(),
            })
    }

    pub async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> PaymentResult<StkTransaction> {
        self.store
            .find_by_checkout_request_id(checkout_request_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound {
                reference: checkout_request_id.to_string(),
            })
    }
}
