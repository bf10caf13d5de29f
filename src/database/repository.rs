//! Storage seam for payment transactions.

use crate::database::error::DatabaseError;
use crate::database::transaction::{PaymentTransaction, TransactionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Result of an idempotent insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(PaymentTransaction),
    /// A record holding the same idempotency key already exists
    Existing(PaymentTransaction),
}

impl InsertOutcome {
    pub fn into_inner(self) -> PaymentTransaction {
        match self {
            InsertOutcome::Inserted(tx) | InsertOutcome::Existing(tx) => tx,
        }
    }
}

/// Durable map from transaction id to record, with the secondary lookups the
/// lifecycle needs. Implementations must make `insert_if_absent` and
/// `update_if_state` atomic with respect to each other.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert `tx` unless another record created at or after `window_start`
    /// holds the same idempotency key in a key-holding state. Older holders
    /// release the key.
    async fn insert_if_absent(
        &self,
        tx: PaymentTransaction,
        window_start: DateTime<Utc>,
    ) -> Result<InsertOutcome, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentTransaction>, DatabaseError>;

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PaymentTransaction>, DatabaseError>;

    /// Most recent record created as a retry of `parent_id`.
    async fn find_latest_retry(
        &self,
        parent_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, DatabaseError>;

    /// Replace the stored record with `tx` only if its state is still
    /// `expected`. Returns `None` when another writer got there first.
    async fn update_if_state(
        &self,
        tx: &PaymentTransaction,
        expected: TransactionState,
    ) -> Result<Option<PaymentTransaction>, DatabaseError>;

    /// Bump the query bookkeeping of a record still in `expected`, leaving
    /// every other column as stored.
    async fn record_query_if_state(
        &self,
        id: Uuid,
        expected: TransactionState,
        queried_at: DateTime<Utc>,
    ) -> Result<Option<PaymentTransaction>, DatabaseError>;

    /// Move the deadline of a record still in `expected` to `new_expires_at`.
    /// `None` when the state moved or the stored deadline is not earlier.
    async fn extend_expiry_if_state(
        &self,
        id: Uuid,
        expected: TransactionState,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentTransaction>, DatabaseError>;

    /// Awaiting records submitted at or before `submitted_before` whose
    /// deadline is still after `live_at`, oldest first.
    async fn list_awaiting_submitted_before(
        &self,
        submitted_before: DateTime<Utc>,
        live_at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>, DatabaseError>;

    /// Non-terminal records whose deadline is at or before `now`.
    async fn list_expired_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>, DatabaseError>;

    async fn list_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>, DatabaseError>;
}
