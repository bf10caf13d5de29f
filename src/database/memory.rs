//! In-process transaction store used by tests and the simulation binary.

use crate::database::error::DatabaseError;
use crate::database::repository::{InsertOutcome, TransactionStore};
use crate::database::transaction::{PaymentTransaction, TransactionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryTransactionStore {
    records: RwLock<HashMap<Uuid, PaymentTransaction>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<PaymentTransaction> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by_key(|tx| tx.created_at);
        all
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert_if_absent(
        &self,
        tx: PaymentTransaction,
        window_start: DateTime<Utc>,
    ) -> Result<InsertOutcome, DatabaseError> {
        let mut records = self.records.write().await;

        let holder = records
            .values()
            .filter(|existing| {
                existing.idempotency_key == tx.idempotency_key
                    && existing.state.holds_idempotency_key()
                    && existing.created_at >= window_start
            })
            .max_by_key(|existing| existing.created_at)
            .cloned();

        if let Some(existing) = holder {
            return Ok(InsertOutcome::Existing(existing));
        }

        records.insert(tx.id, tx.clone());
        Ok(InsertOutcome::Inserted(tx))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentTransaction>, DatabaseError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|tx| tx.checkout_request_id.as_deref() == Some(checkout_request_id))
            .cloned())
    }

    async fn find_latest_retry(
        &self,
        parent_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|tx| tx.retry_of == Some(parent_id))
            .max_by_key(|tx| tx.created_at)
            .cloned())
    }

    async fn update_if_state(
        &self,
        tx: &PaymentTransaction,
        expected: TransactionState,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let mut records = self.records.write().await;
        match records.get_mut(&tx.id) {
            Some(stored) if stored.state == expected => {
                *stored = tx.clone();
                Ok(Some(tx.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn record_query_if_state(
        &self,
        id: Uuid,
        expected: TransactionState,
        queried_at: DateTime<Utc>,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(stored) if stored.state == expected => {
                stored.query_count += 1;
                stored.last_query_at = Some(queried_at);
                stored.updated_at = queried_at;
                Ok(Some(stored.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn extend_expiry_if_state(
        &self,
        id: Uuid,
        expected: TransactionState,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(stored) if stored.state == expected && stored.expires_at < new_expires_at => {
                stored.expires_at = new_expires_at;
                stored.updated_at = now;
                Ok(Some(stored.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_awaiting_submitted_before(
        &self,
        submitted_before: DateTime<Utc>,
        live_at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>, DatabaseError> {
        let records = self.records.read().await;
        let mut matches: Vec<_> = records
            .values()
            .filter(|tx| {
                tx.state == TransactionState::AwaitingConfirmation
                    && tx.submitted_at.is_some_and(|at| at <= submitted_before)
                    && !tx.is_past_deadline(live_at)
            })
            .cloned()
            .collect();
        matches.sort_by_key(|tx| tx.submitted_at);
        matches.truncate(limit);
        Ok(matches)
    }

    async fn list_expired_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>, DatabaseError> {
        let records = self.records.read().await;
        let mut matches: Vec<_> = records
            .values()
            .filter(|tx| !tx.is_terminal() && tx.is_past_deadline(now))
            .cloned()
            .collect();
        matches.sort_by_key(|tx| tx.expires_at);
        matches.truncate(limit);
        Ok(matches)
    }

    async fn list_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>, DatabaseError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|tx| tx.created_at >= from && tx.created_at < to)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::transaction::NewTransaction;
    use chrono::Duration;

    fn tx(key: &str, now: DateTime<Utc>) -> PaymentTransaction {
        PaymentTransaction::new(
            NewTransaction {
                idempotency_key: key.to_string(),
                tenant_id: "t".to_string(),
                order_id: "o".to_string(),
                order_reference: "o".to_string(),
                phone_number: "254708374149".to_string(),
                amount: 100,
                description: "d".to_string(),
                max_retries: 3,
                retry_count: 0,
                retry_of: None,
            },
            now,
            Duration::minutes(5),
        )
    }

    #[tokio::test]
    async fn duplicate_key_returns_existing_record() {
        let store = InMemoryTransactionStore::new();
        let now = Utc::now();
        let window = now - Duration::hours(24);

        let first = store.insert_if_absent(tx("k", now), window).await.unwrap();
        let second = store.insert_if_absent(tx("k", now), window).await.unwrap();

        let first = match first {
            InsertOutcome::Inserted(tx) => tx,
            other => panic!("expected insert, got {:?}", other),
        };
        assert_eq!(second, InsertOutcome::Existing(first));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn failed_or_aged_holders_release_the_key() {
        let store = InMemoryTransactionStore::new();
        let now = Utc::now();
        let window = now - Duration::hours(24);

        let first = store.insert_if_absent(tx("k", now), window).await.unwrap().into_inner();
        let failed = first.transitioned(TransactionState::Failed, now).unwrap();
        store
            .update_if_state(&failed, TransactionState::Created)
            .await
            .unwrap()
            .expect("state matched");

        let again = store.insert_if_absent(tx("k", now), window).await.unwrap();
        assert!(matches!(again, InsertOutcome::Inserted(_)));

        let aged = store
            .insert_if_absent(tx("old", now - Duration::hours(30)), window)
            .await
            .unwrap();
        assert!(matches!(aged, InsertOutcome::Inserted(_)));
        let fresh = store.insert_if_absent(tx("old", now), window).await.unwrap();
        assert!(matches!(fresh, InsertOutcome::Inserted(_)));
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_state() {
        let store = InMemoryTransactionStore::new();
        let now = Utc::now();
        let created = store
            .insert_if_absent(tx("k", now), now)
            .await
            .unwrap()
            .into_inner();

        let expired = created.transitioned(TransactionState::Expired, now).unwrap();
        assert!(store
            .update_if_state(&expired, TransactionState::Created)
            .await
            .unwrap()
            .is_some());

        let awaiting = created
            .transitioned(TransactionState::AwaitingConfirmation, now)
            .unwrap();
        assert!(store
            .update_if_state(&awaiting, TransactionState::Created)
            .await
            .unwrap()
            .is_none());
        let stored = store.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransactionState::Expired);
    }

    fn awaiting(key: &str, submitted_at: DateTime<Utc>) -> PaymentTransaction {
        let mut tx = tx(key, submitted_at)
            .transitioned(TransactionState::AwaitingConfirmation, submitted_at)
            .unwrap();
        tx.submitted_at = Some(submitted_at);
        tx
    }

    #[tokio::test]
    async fn query_candidates_exclude_records_past_deadline() {
        let store = InMemoryTransactionStore::new();
        let t0 = Utc::now() - Duration::minutes(10);
        let overdue = awaiting("overdue", t0);
        let due = awaiting("due", t0 + Duration::minutes(5));
        store.insert_if_absent(overdue, t0).await.unwrap();
        let due = store.insert_if_absent(due, t0).await.unwrap().into_inner();

        let now = t0 + Duration::seconds(340);
        let listed = store
            .list_awaiting_submitted_before(now - Duration::seconds(30), now, 1)
            .await
            .unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, due.id);
    }

    #[tokio::test]
    async fn query_bookkeeping_keeps_other_columns() {
        let store = InMemoryTransactionStore::new();
        let now = Utc::now();
        let stored = store
            .insert_if_absent(awaiting("k", now), now)
            .await
            .unwrap()
            .into_inner();
        let later = stored.expires_at + Duration::minutes(30);
        store
            .extend_expiry_if_state(stored.id, stored.state, later, now)
            .await
            .unwrap()
            .expect("deadline moved");

        let queried_at = now + Duration::seconds(40);
        let saved = store
            .record_query_if_state(stored.id, TransactionState::AwaitingConfirmation, queried_at)
            .await
            .unwrap()
            .expect("state matched");

        assert_eq!(saved.expires_at, later);
        assert_eq!(saved.query_count, 1);
        assert_eq!(saved.last_query_at, Some(queried_at));
        assert!(store
            .extend_expiry_if_state(stored.id, stored.state, stored.expires_at, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_candidates_skip_terminal_records() {
        let store = InMemoryTransactionStore::new();
        let now = Utc::now();
        let past = now - Duration::minutes(10);

        let stale = store.insert_if_absent(tx("a", past), past).await.unwrap().into_inner();
        let done = store.insert_if_absent(tx("b", past), past).await.unwrap().into_inner();
        let failed = done.transitioned(TransactionState::Failed, past).unwrap();
        store.update_if_state(&failed, TransactionState::Created).await.unwrap();
        store.insert_if_absent(tx("c", now), now).await.unwrap();

        let candidates = store.list_expired_candidates(now, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, stale.id);
    }
}
