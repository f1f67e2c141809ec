use crate::database::error::DbResult;
use crate::database::stk_transaction_repository::{
    NewStkTransaction, ReconciliationTrace, StkTransaction, TerminalUpdate,
};
use crate::payments::types::CallbackMetadata;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Durable storage for STK push transactions.
///
/// `checkout_request_id` is the correlation key for every mutation. The two
/// terminal writes are conditional on the stored status so racing callers
/// can never both win.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a new pending transaction. Fails with a unique-constraint error
    /// if the checkout request id is already known.
    async fn insert_pending(&self, new: NewStkTransaction) -> DbResult<StkTransaction>;

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<StkTransaction>>;

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> DbResult<Option<StkTransaction>>;

    /// Move a pending transaction to its terminal state.
    ///
    /// Returns `None` when no pending row matched, i.e. the id is unknown or
    /// another writer already completed it.
    async fn complete_pending(
        &self,
        checkout_request_id: &str,
        update: &TerminalUpdate,
    ) -> DbResult<Option<StkTransaction>>;

    /// Fill secondary fields on an already terminal transaction without
    /// touching its status, result code or description. Only fields that are
    /// still unset are written, except `last_checked_at` which always moves
    /// forward.
    async fn backfill_terminal(
        &self,
        checkout_request_id: &str,
        metadata: &CallbackMetadata,
        trace: &ReconciliationTrace,
    ) -> DbResult<Option<StkTransaction>>;

    /// Stamp `last_checked_at` after a status query that produced no result.
    async fn mark_checked(&self, checkout_request_id: &str, at: DateTime<Utc>) -> DbResult<bool>;

    /// Pending transactions initiated before `older_than` and not checked since.
    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<StkTransaction>>;

    async fn health_check(&self) -> DbResult<()>;
}
