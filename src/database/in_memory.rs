use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::database::repository::TransactionStore;
use crate::database::stk_transaction_repository::{
    NewStkTransaction, ReconciliationTrace, StkTransaction, TerminalUpdate,
};
use crate::payments::types::{CallbackMetadata, TransactionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A thread-safe in-memory transaction store keyed by checkout request id.
///
/// Every conditional update runs under the write lock, which gives the same
/// single-winner guarantee as the conditional SQL in [`PgTransactionStore`].
/// Used when no database is configured and throughout the tests.
///
/// [`PgTransactionStore`]: crate::database::stk_transaction_repository::PgTransactionStore
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<HashMap<String, StkTransaction>>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.transactions.read().await.is_empty()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert_pending(&self, new: NewStkTransaction) -> DbResult<StkTransaction> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&new.checkout_request_id) {
            return Err(DatabaseError::new(
                DatabaseErrorKind::UniqueConstraintViolation {
                    column: "checkout_request_id".to_string(),
                    value: new.checkout_request_id,
                },
            ));
        }
        let tx = StkTransaction::pending(new, Utc::now());
        transactions.insert(tx.checkout_request_id.clone(), tx.clone());
        Ok(tx)
    }

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<StkTransaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.values().find(|tx| tx.id == id).cloned())
    }

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> DbResult<Option<StkTransaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(checkout_request_id).cloned())
    }

    async fn complete_pending(
        &self,
        checkout_request_id: &str,
        update: &TerminalUpdate,
    ) -> DbResult<Option<StkTransaction>> {
        let mut transactions = self.transactions.write().await;
        Ok(transactions
            .get_mut(checkout_request_id)
            .filter(|tx| tx.status == TransactionStatus::Pending)
            .and_then(|tx| tx.apply_terminal(update, Utc::now()).then(|| tx.clone())))
    }

    async fn backfill_terminal(
        &self,
        checkout_request_id: &str,
        metadata: &CallbackMetadata,
        trace: &ReconciliationTrace,
    ) -> DbResult<Option<StkTransaction>> {
        let mut transactions = self.transactions.write().await;
        Ok(transactions
            .get_mut(checkout_request_id)
            .and_then(|tx| tx.backfill(metadata, trace, Utc::now()).then(|| tx.clone())))
    }

    async fn mark_checked(&self, checkout_request_id: &str, at: DateTime<Utc>) -> DbResult<bool> {
        let mut transactions = self.transactions.write().await;
        match transactions.get_mut(checkout_request_id) {
            Some(tx) => {
                tx.last_checked_at = Some(at);
                tx.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<StkTransaction>> {
        let transactions = self.transactions.read().await;
        let mut stale: Vec<StkTransaction> = transactions
            .values()
            .filter(|tx| tx.status == TransactionStatus::Pending)
            .filter(|tx| tx.initiated_at < older_than)
            .filter(|tx| tx.last_checked_at.map_or(true, |at| at < older_than))
            .cloned()
            .collect();
        stale.sort_by_key(|tx| tx.initiated_at);
        stale.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stale)
    }

    async fn health_check(&self) -> DbResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::ResultCode;
    use chrono::Duration;

    fn new_tx(checkout_request_id: &str) -> NewStkTransaction {
        NewStkTransaction {
            subscriber_address: "254712345678".to_string(),
            amount_minor_units: 100,
            account_reference: "INV-7".to_string(),
            merchant_request_id: "29115-34620561-1".to_string(),
            checkout_request_id: checkout_request_id.to_string(),
        }
    }

    fn failed() -> TerminalUpdate {
        TerminalUpdate {
            status: TransactionStatus::Failed,
            result_code: ResultCode::new("1032"),
            result_description: "Request cancelled by user".to_string(),
            metadata: None,
            trace: ReconciliationTrace::default(),
        }
    }

    #[tokio::test]
    async fn duplicate_checkout_request_id_is_rejected() {
        let store = InMemoryTransactionStore::new();
        store.insert_pending(new_tx("ws_CO_1")).await.unwrap();
        let err = store.insert_pending(new_tx("ws_CO_1")).await.unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn lookup_by_id_and_checkout_request_id() {
        let store = InMemoryTransactionStore::new();
        let created = store.insert_pending(new_tx("ws_CO_2")).await.unwrap();

        let by_id = store.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(by_id.checkout_request_id, "ws_CO_2");
        assert!(store
            .find_by_checkout_request_id("ws_CO_missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn complete_pending_has_single_winner() {
        let store = InMemoryTransactionStore::new();
        store.insert_pending(new_tx("ws_CO_3")).await.unwrap();

        assert!(store
            .complete_pending("ws_CO_3", &failed())
            .await
            .unwrap()
            .is_some());
        assert!(store
            .complete_pending("ws_CO_3", &failed())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .complete_pending("ws_CO_unknown", &failed())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stale_pending_excludes_recent_and_checked() {
        let store = InMemoryTransactionStore::new();
        store.insert_pending(new_tx("ws_CO_old")).await.unwrap();
        store.insert_pending(new_tx("ws_CO_checked")).await.unwrap();
        store.insert_pending(new_tx("ws_CO_done")).await.unwrap();
        store.complete_pending("ws_CO_done", &failed()).await.unwrap();

        let future = Utc::now() + Duration::seconds(5);
        store
            .mark_checked("ws_CO_checked", future + Duration::seconds(1))
            .await
            .unwrap();

        let stale = store.find_stale_pending(future, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].checkout_request_id, "ws_CO_old");

        let none = store
            .find_stale_pending(Utc::now() - Duration::hours(1), 10)
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
