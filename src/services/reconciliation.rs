//! Reconciliation Coordinator
//!
//! Applies definitive gateway results to stored transactions. Results arrive
//! from two independent paths, the asynchronous callback and the
//! caller-initiated status poll, and may race on the same record. The
//! `Pending -> terminal` transition is a single conditional store update, so
//! exactly one path wins; the other falls through to an idempotent backfill
//! that never changes status.

use crate::database::repository::TransactionStore;
use crate::database::stk_transaction_repository::{
    ReconciliationTrace, StkTransaction, TerminalUpdate,
};
use crate::payments::callback::StkCallback;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::StkPushGateway;
use crate::payments::types::{
    CallbackMetadata, GatewayResult, ReconciliationSource, TransactionStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// What a reconciliation attempt did to the stored record.
#[derive(Debug, Clone)]
pub struct ReconciliationOutcome {
    pub transaction: StkTransaction,
    /// `true` only for the call that performed the terminal transition.
    pub applied: bool,
}

/// Reply to a processed callback.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackAck {
    pub status: TransactionStatus,
    pub transaction_id: Uuid,
}

/// Reply to a status poll.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResult {
    pub checkout_request_id: String,
    pub status: TransactionStatus,
    pub result_code: Option<String>,
    pub result_description: Option<String>,
    pub receipt_number: Option<String>,
    pub transaction_date: Option<DateTime<Utc>>,
}

impl From<&StkTransaction> for PollResult {
    fn from(tx: &StkTransaction) -> Self {
        Self {
            checkout_request_id: tx.checkout_request_id.clone(),
            status: tx.status,
            result_code: tx.result_code.clone(),
            result_description: tx.result_description.clone(),
            receipt_number: tx.receipt_number.clone(),
            transaction_date: tx.transaction_timestamp,
        }
    }
}

#[derive(Clone)]
pub struct ReconciliationCoordinator {
    store: Arc<dyn TransactionStore>,
    gateway: Arc<dyn StkPushGateway>,
}

impl ReconciliationCoordinator {
    pub fn new(store: Arc<dyn TransactionStore>, gateway: Arc<dyn StkPushGateway>) -> Self {
        Self { store, gateway }
    }

    /// Applies a definitive result for `checkout_request_id`.
    ///
    /// Unknown ids are rejected with [`PaymentError::NotFound`] for both
    /// sources; no record is ever created here.
    #[instrument(skip(self, result, raw_payload), fields(result_code = %result.result_code))]
    pub async fn apply_result(
        &self,
        checkout_request_id: &str,
        result: GatewayResult,
        source: ReconciliationSource,
        raw_payload: Option<JsonValue>,
    ) -> PaymentResult<ReconciliationOutcome> {
        let existing = self.require(checkout_request_id).await?;

        let now = Utc::now();
        let trace = match source {
            ReconciliationSource::Callback => ReconciliationTrace {
                callback_received_at: Some(now),
                last_checked_at: None,
                raw_callback_payload: raw_payload,
            },
            ReconciliationSource::Poll => ReconciliationTrace {
                callback_received_at: None,
                last_checked_at: Some(now),
                raw_callback_payload: None,
            },
        };

        let status = TransactionStatus::from_result_code(&result.result_code);
        let metadata = match status {
            TransactionStatus::Completed => result.metadata,
            _ => None,
        };

        if existing.status.is_terminal() {
            return self.backfill(existing, metadata, trace, source).await;
        }

        let update = TerminalUpdate {
            status,
            result_code: result.result_code,
            result_description: result.result_description,
            metadata,
            trace,
        };

        match self
            .store
            .complete_pending(checkout_request_id, &update)
            .await?
        {
            Some(transaction) => {
                info!(
                    transaction_id = %transaction.id,
                    status = %transaction.status,
                    source = %source,
                    receipt_number = transaction.receipt_number.as_deref().unwrap_or(""),
                    "transaction reconciled"
                );
                Ok(ReconciliationOutcome {
                    transaction,
                    applied: true,
                })
            }
            None => {
                debug!(source = %source, "lost reconciliation race, falling back to backfill");
                let current = self.require(checkout_request_id).await?;
                self.backfill(current, update.metadata, update.trace, source)
                    .await
            }
        }
    }

    /// Parses and applies an inbound callback payload.
    pub async fn handle_callback(&self, payload: &JsonValue) -> PaymentResult<CallbackAck> {
        let callback = StkCallback::from_payload(payload)?;
        info!(
            checkout_request_id = %callback.checkout_request_id,
            merchant_request_id = %callback.merchant_request_id,
            result_code = %callback.result_code,
            "stk callback received"
        );

        let (checkout_request_id, result) = callback.into_result();
        let outcome = self
            .apply_result(
                &checkout_request_id,
                result,
                ReconciliationSource::Callback,
                Some(payload.clone()),
            )
            .await
            .inspect_err(|e| {
                if matches!(e, PaymentError::NotFound { .. }) {
                    warn!(
                        checkout_request_id = %checkout_request_id,
                        "callback for unknown checkout request id"
                    );
                }
            })?;

        Ok(CallbackAck {
            status: outcome.transaction.status,
            transaction_id: outcome.transaction.id,
        })
    }

    /// Queries the gateway for a known transaction and applies the answer.
    ///
    /// A gateway rejection (for example "still being processed") only stamps
    /// `last_checked_at`; timeouts and transport failures leave the record
    /// untouched. Both are returned to the caller.
    #[instrument(skip(self))]
    pub async fn poll_status(&self, checkout_request_id: &str) -> PaymentResult<PollResult> {
        self.require(checkout_request_id).await?;

        match self.gateway.query_status(checkout_request_id).await {
            Ok(answer) => {
                let outcome = self
                    .apply_result(
                        checkout_request_id,
                        GatewayResult::from(answer),
                        ReconciliationSource::Poll,
                        None,
                    )
                    .await?;
                Ok(PollResult::from(&outcome.transaction))
            }
            Err(err @ PaymentError::GatewayRejected { .. }) => {
                info!(error = %err, "status query returned no definitive result");
                self.store
                    .mark_checked(checkout_request_id, Utc::now())
                    .await?;
                Err(err)
            }
            Err(err) => {
                warn!(error = %err, retryable = err.is_retryable(), "status query failed");
                Err(err)
            }
        }
    }

    async fn require(&self, checkout_request_id: &str) -> PaymentResult<StkTransaction> {
        self.store
            .find_by_checkout_request_id(checkout_request_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound {
                reference: checkout_request_id.to_string(),
            })
    }

    async fn backfill(
        &self,
        existing: StkTransaction,
        metadata: Option<CallbackMetadata>,
        trace: ReconciliationTrace,
        source: ReconciliationSource,
    ) -> PaymentResult<ReconciliationOutcome> {
        // success metadata never lands on a failed record
        let metadata = match existing.status {
            TransactionStatus::Completed => metadata.unwrap_or_default(),
            _ => CallbackMetadata::default(),
        };

        let transaction = self
            .store
            .backfill_terminal(&existing.checkout_request_id, &metadata, &trace)
            .await?
            .unwrap_or(existing);

        debug!(
            transaction_id = %transaction.id,
            status = %transaction.status,
            source = %source,
            "transaction already terminal, status unchanged"
        );
        Ok(ReconciliationOutcome {
            transaction,
            applied: false,
        })
    }
}
