use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::database::repository::TransactionStore;
use crate::payments::types::{CallbackMetadata, ResultCode, TransactionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// STK push transaction entity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StkTransaction {
    pub id: Uuid,
    pub subscriber_address: String,
    pub amount_minor_units: i64,
    pub account_reference: String,
    pub status: TransactionStatus,
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub receipt_number: Option<String>,
    pub result_code: Option<String>,
    pub result_description: Option<String>,
    pub transaction_timestamp: Option<DateTime<Utc>>,
    pub initiated_at: DateTime<Utc>,
    pub callback_received_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub raw_callback_payload: Option<JsonValue>,
    pub updated_at: DateTime<Utc>,
}

impl StkTransaction {
    /// Record created right after the gateway accepted a push.
    pub fn pending(new: NewStkTransaction, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscriber_address: new.subscriber_address,
            amount_minor_units: new.amount_minor_units,
            account_reference: new.account_reference,
            status: TransactionStatus::Pending,
            merchant_request_id: new.merchant_request_id,
            checkout_request_id: new.checkout_request_id,
            receipt_number: None,
            result_code: None,
            result_description: None,
            transaction_timestamp: None,
            initiated_at: now,
            callback_received_at: None,
            last_checked_at: None,
            raw_callback_payload: None,
            updated_at: now,
        }
    }

    /// In-process equivalent of the conditional terminal UPDATE.
    /// Returns `false` and leaves the record untouched unless it is pending.
    pub fn apply_terminal(&mut self, update: &TerminalUpdate, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        self.status = update.status;
        self.result_code = Some(update.result_code.as_str().to_string());
        self.result_description = Some(update.result_description.clone());
        if let Some(metadata) = &update.metadata {
            if let Some(receipt) = &metadata.receipt_number {
                self.receipt_number = Some(receipt.clone());
            }
            if let Some(amount) = metadata.amount_minor_units {
                self.amount_minor_units = amount;
            }
            if let Some(subscriber) = &metadata.subscriber_address {
                self.subscriber_address = subscriber.clone();
            }
            if metadata.transaction_timestamp.is_some() {
                self.transaction_timestamp = metadata.transaction_timestamp;
            }
        }
        self.record_trace(&update.trace);
        self.updated_at = now;
        true
    }

    /// In-process equivalent of the terminal backfill UPDATE.
    pub fn backfill(
        &mut self,
        metadata: &CallbackMetadata,
        trace: &ReconciliationTrace,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.status.is_terminal() {
            return false;
        }

        // gateway-reported amount and subscriber only land with the first receipt
        if self.receipt_number.is_none() {
            if let Some(amount) = metadata.amount_minor_units {
                self.amount_minor_units = amount;
            }
            if let Some(subscriber) = &metadata.subscriber_address {
                self.subscriber_address = subscriber.clone();
            }
        }
        if self.receipt_number.is_none() {
            self.receipt_number = metadata.receipt_number.clone();
        }
        if self.transaction_timestamp.is_none() {
            self.transaction_timestamp = metadata.transaction_timestamp;
        }
        self.record_trace(trace);
        self.updated_at = now;
        true
    }

    fn record_trace(&mut self, trace: &ReconciliationTrace) {
        if self.callback_received_at.is_none() {
            self.callback_received_at = trace.callback_received_at;
        }
        if self.raw_callback_payload.is_none() {
            self.raw_callback_payload = trace.raw_callback_payload.clone();
        }
        if trace.last_checked_at.is_some() {
            self.last_checked_at = trace.last_checked_at;
        }
    }
}

/// Fields known when the gateway acknowledges a push.
#[derive(Debug, Clone)]
pub struct NewStkTransaction {
    pub subscriber_address: String,
    pub amount_minor_units: i64,
    pub account_reference: String,
    pub merchant_request_id: String,
    pub checkout_request_id: String,
}

/// Audit fields left by whichever reconciliation path touched the record.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationTrace {
    pub callback_received_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub raw_callback_payload: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct TerminalUpdate {
    pub status: TransactionStatus,
    pub result_code: ResultCode,
    pub result_description: String,
    pub metadata: Option<CallbackMetadata>,
    pub trace: ReconciliationTrace,
}

#[derive(Debug, FromRow)]
struct StkTransactionRow {
    id: Uuid,
    subscriber_address: String,
    amount_minor_units: i64,
    account_reference: String,
    status: String,
    merchant_request_id: String,
    checkout_request_id: String,
    receipt_number: Option<String>,
    result_code: Option<String>,
    result_description: Option<String>,
    transaction_timestamp: Option<DateTime<Utc>>,
    initiated_at: DateTime<Utc>,
    callback_received_at: Option<DateTime<Utc>>,
    last_checked_at: Option<DateTime<Utc>>,
    raw_callback_payload: Option<JsonValue>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StkTransactionRow> for StkTransaction {
    type Error = DatabaseError;

    fn try_from(row: StkTransactionRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<TransactionStatus>().map_err(|e| {
            DatabaseError::new(DatabaseErrorKind::QueryError {
                message: e.to_string(),
            })
            .with_context(row.checkout_request_id.clone())
        })?;

        Ok(Self {
            id: row.id,
            subscriber_address: row.subscriber_address,
            amount_minor_units: row.amount_minor_units,
            account_reference: row.account_reference,
            status,
            merchant_request_id: row.merchant_request_id,
            checkout_request_id: row.checkout_request_id,
            receipt_number: row.receipt_number,
            result_code: row.result_code,
            result_description: row.result_description,
            transaction_timestamp: row.transaction_timestamp,
            initiated_at: row.initiated_at,
            callback_received_at: row.callback_received_at,
            last_checked_at: row.last_checked_at,
            raw_callback_payload: row.raw_callback_payload,
            updated_at: row.updated_at,
        })
    }
}

fn convert(row: Option<StkTransactionRow>) -> DbResult<Option<StkTransaction>> {
    row.map(StkTransaction::try_from).transpose()
}

/// Postgres-backed transaction store
pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn insert_pending(&self, new: NewStkTransaction) -> DbResult<StkTransaction> {
        let row = sqlx::query_as::<_, StkTransactionRow>(
            "INSERT INTO stk_transactions
             (id, subscriber_address, amount_minor_units, account_reference, status,
              merchant_request_id, checkout_request_id)
             VALUES ($1, $2, $3, $4, 'pending', $5, $6)
             RETURNING id, subscriber_address, amount_minor_units, account_reference, status,
                       merchant_request_id, checkout_request_id, receipt_number, result_code,
                       result_description, transaction_timestamp, initiated_at,
                       callback_received_at, last_checked_at, raw_callback_payload, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(&new.subscriber_address)
        .bind(new.amount_minor_units)
        .bind(&new.account_reference)
        .bind(&new.merchant_request_id)
        .bind(&new.checkout_request_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DatabaseError::from_sqlx(e).with_context("insert_pending"))?;

        StkTransaction::try_from(row)
    }

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<StkTransaction>> {
        let row = sqlx::query_as::<_, StkTransactionRow>(
            "SELECT id, subscriber_address, amount_minor_units, account_reference, status,
                    merchant_request_id, checkout_request_id, receipt_number, result_code,
                    result_description, transaction_timestamp, initiated_at,
                    callback_received_at, last_checked_at, raw_callback_payload, updated_at
             FROM stk_transactions
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        convert(row)
    }

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> DbResult<Option<StkTransaction>> {
        let row = sqlx::query_as::<_, StkTransactionRow>(
            "SELECT id, subscriber_address, amount_minor_units, account_reference, status,
                    merchant_request_id, checkout_request_id, receipt_number, result_code,
                    result_description, transaction_timestamp, initiated_at,
                    callback_received_at, last_checked_at, raw_callback_payload, updated_at
             FROM stk_transactions
             WHERE checkout_request_id = $1",
        )
        .bind(checkout_request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        convert(row)
    }

    async fn complete_pending(
        &self,
        checkout_request_id: &str,
        update: &TerminalUpdate,
    ) -> DbResult<Option<StkTransaction>> {
        let metadata = update.metadata.clone().unwrap_or_default();

        let row = sqlx::query_as::<_, StkTransactionRow>(
            "UPDATE stk_transactions
             SET status = $2,
                 result_code = $3,
                 result_description = $4,
                 receipt_number = COALESCE($5, receipt_number),
                 amount_minor_units = COALESCE($6, amount_minor_units),
                 subscriber_address = COALESCE($7, subscriber_address),
                 transaction_timestamp = COALESCE($8, transaction_timestamp),
                 callback_received_at = COALESCE(callback_received_at, $9),
                 last_checked_at = COALESCE($10, last_checked_at),
                 raw_callback_payload = COALESCE(raw_callback_payload, $11),
                 updated_at = NOW()
             WHERE checkout_request_id = $1 AND status = 'pending'
             RETURNING id, subscriber_address, amount_minor_units, account_reference, status,
                       merchant_request_id, checkout_request_id, receipt_number, result_code,
                       result_description, transaction_timestamp, initiated_at,
                       callback_received_at, last_checked_at, raw_callback_payload, updated_at",
        )
        .bind(checkout_request_id)
        .bind(update.status.as_str())
        .bind(update.result_code.as_str())
        .bind(&update.result_description)
        .bind(&metadata.receipt_number)
        .bind(metadata.amount_minor_units)
        .bind(&metadata.subscriber_address)
        .bind(metadata.transaction_timestamp)
        .bind(update.trace.callback_received_at)
        .bind(update.trace.last_checked_at)
        .bind(&update.trace.raw_callback_payload)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DatabaseError::from_sqlx(e).with_context("complete_pending"))?;

        convert(row)
    }

    async fn backfill_terminal(
        &self,
        checkout_request_id: &str,
        metadata: &CallbackMetadata,
        trace: &ReconciliationTrace,
    ) -> DbResult<Option<StkTransaction>> {
        // SET expressions all see the pre-update row
        let row = sqlx::query_as::<_, StkTransactionRow>(
            "UPDATE stk_transactions
             SET amount_minor_units = CASE WHEN receipt_number IS NULL
                                           THEN COALESCE($3, amount_minor_units)
                                           ELSE amount_minor_units END,
                 subscriber_address = CASE WHEN receipt_number IS NULL
                                           THEN COALESCE($4, subscriber_address)
                                           ELSE subscriber_address END,
                 receipt_number = COALESCE(receipt_number, $2),
                 transaction_timestamp = COALESCE(transaction_timestamp, $5),
                 callback_received_at = COALESCE(callback_received_at, $6),
                 last_checked_at = COALESCE($7, last_checked_at),
                 raw_callback_payload = COALESCE(raw_callback_payload, $8),
                 updated_at = NOW()
             WHERE checkout_request_id = $1 AND status <> 'pending'
             RETURNING id, subscriber_address, amount_minor_units, account_reference, status,
                       merchant_request_id, checkout_request_id, receipt_number, result_code,
                       result_description, transaction_timestamp, initiated_at,
                       callback_received_at, last_checked_at, raw_callback_payload, updated_at",
        )
        .bind(checkout_request_id)
        .bind(&metadata.receipt_number)
        .bind(metadata.amount_minor_units)
        .bind(&metadata.subscriber_address)
        .bind(metadata.transaction_timestamp)
        .bind(trace.callback_received_at)
        .bind(trace.last_checked_at)
        .bind(&trace.raw_callback_payload)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DatabaseError::from_sqlx(e).with_context("backfill_terminal"))?;

        convert(row)
    }

    async fn mark_checked(&self, checkout_request_id: &str, at: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE stk_transactions SET last_checked_at = $2, updated_at = NOW() WHERE checkout_request_id = $1",
        )
        .bind(checkout_request_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<StkTransaction>> {
        let rows = sqlx::query_as::<_, StkTransactionRow>(
            "SELECT id, subscriber_address, amount_minor_units, account_reference, status,
                    merchant_request_id, checkout_request_id, receipt_number, result_code,
                    result_description, transaction_timestamp, initiated_at,
                    callback_received_at, last_checked_at, raw_callback_payload, updated_at
             FROM stk_transactions
             WHERE status = 'pending'
               AND initiated_at < $1
               AND (last_checked_at IS NULL OR last_checked_at < $1)
             ORDER BY initiated_at ASC
             LIMIT $2",
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        rows.into_iter().map(StkTransaction::try_from).collect()
    }

    async fn health_check(&self) -> DbResult<()> {
        crate::database::health_check(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pending() -> StkTransaction {
        StkTransaction::pending(
            NewStkTransaction {
                subscriber_address: "254712345678".to_string(),
                amount_minor_units: 70000,
                account_reference: "BuyGoods".to_string(),
                merchant_request_id: "29115-34620561-1".to_string(),
                checkout_request_id: "ws_CO_1".to_string(),
            },
            Utc::now(),
        )
    }

    fn completed_update(metadata: Option<CallbackMetadata>) -> TerminalUpdate {
        TerminalUpdate {
            status: TransactionStatus::Completed,
            result_code: ResultCode::success(),
            result_description: "The service request is processed successfully.".to_string(),
            metadata,
            trace: ReconciliationTrace::default(),
        }
    }

    #[test]
    fn terminal_transition_applies_once() {
        let mut tx = pending();
        let now = Utc::now();
        assert!(tx.apply_terminal(&completed_update(None), now));
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.result_code.as_deref(), Some("0"));

        let failed = TerminalUpdate {
            status: TransactionStatus::Failed,
            result_code: ResultCode::new("1032"),
            result_description: "Request cancelled by user".to_string(),
            metadata: None,
            trace: ReconciliationTrace::default(),
        };
        assert!(!tx.apply_terminal(&failed, now));
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.result_code.as_deref(), Some("0"));
    }

    #[test]
    fn backfill_only_fills_unset_fields() {
        let mut tx = pending();
        let now = Utc::now();
        tx.apply_terminal(&completed_update(None), now);

        let first = CallbackMetadata {
            receipt_number: Some("NLJ7RT61SV".to_string()),
            amount_minor_units: Some(69999),
            subscriber_address: None,
            transaction_timestamp: Some(now),
        };
        assert!(tx.backfill(&first, &ReconciliationTrace::default(), now));
        assert_eq!(tx.receipt_number.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(tx.amount_minor_units, 69999);

        let second = CallbackMetadata {
            receipt_number: Some("OTHER".to_string()),
            amount_minor_units: Some(1),
            subscriber_address: Some("254700000000".to_string()),
            transaction_timestamp: Some(now + Duration::hours(1)),
        };
        tx.backfill(&second, &ReconciliationTrace::default(), now);
        assert_eq!(tx.receipt_number.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(tx.amount_minor_units, 69999);
        assert_eq!(tx.subscriber_address, "254712345678");
        assert_eq!(tx.transaction_timestamp, Some(now));
        assert_eq!(tx.status, TransactionStatus::Completed);
    }

    #[test]
    fn backfill_refuses_pending_records() {
        let mut tx = pending();
        assert!(!tx.backfill(
            &CallbackMetadata::default(),
            &ReconciliationTrace::default(),
            Utc::now()
        ));
    }

    #[test]
    fn serialized_entity_hides_raw_payload() {
        let mut tx = pending();
        tx.raw_callback_payload = Some(serde_json::json!({"secret": "x"}));
        let value = serde_json::to_value(&tx).unwrap();
        assert!(value.get("rawCallbackPayload").is_none());
        assert_eq!(value["checkoutRequestId"], "ws_CO_1");
        assert_eq!(value["status"], "pending");
    }
}
