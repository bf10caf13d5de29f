use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::repository::{InsertOutcome, TransactionStore};
use crate::database::transaction::{PaymentTransaction, TransactionState};
use crate::payments::types::{ErrorCategory, ReceiptSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

const COLUMNS: &str = "id, idempotency_key, tenant_id, order_id, order_reference, phone_number, \
     amount, description, merchant_request_id, checkout_request_id, state, previous_state, \
     status_reason, result_code, result_description, receipt_number, receipt_source, paid_amount, created_at, \
     submitted_at, expires_at, callback_received_at, completed_at, retry_count, max_retries, \
     last_retry_at, retry_of, error_message, error_category, error_retryable, retry_after_secs, \
     query_count, last_query_at, recovered_via_query, updated_at";

/// Row shape of `payment_transactions`
#[derive(Debug, Clone, FromRow)]
struct PaymentTransactionRow {
    id: Uuid,
    idempotency_key: String,
    tenant_id: String,
    order_id: String,
    order_reference: String,
    phone_number: String,
    amount: i64,
    description: String,
    merchant_request_id: Option<String>,
    checkout_request_id: Option<String>,
    state: String,
    previous_state: Option<String>,
    status_reason: Option<String>,
    result_code: Option<i32>,
    result_description: Option<String>,
    receipt_number: Option<String>,
    receipt_source: Option<String>,
    paid_amount: Option<i64>,
    created_at: DateTime<Utc>,
    submitted_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    callback_received_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    last_retry_at: Option<DateTime<Utc>>,
    retry_of: Option<Uuid>,
    error_message: Option<String>,
    error_category: Option<String>,
    error_retryable: bool,
    retry_after_secs: i64,
    query_count: i32,
    last_query_at: Option<DateTime<Utc>>,
    recovered_via_query: bool,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentTransactionRow> for PaymentTransaction {
    type Error = DatabaseError;

    fn try_from(row: PaymentTransactionRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<TransactionState>()
            .map_err(|e| DatabaseError::decode("state", e))?;
        let previous_state = row
            .previous_state
            .as_deref()
            .map(str::parse::<TransactionState>)
            .transpose()
            .map_err(|e| DatabaseError::decode("previous_state", e))?;
        let error_category = row
            .error_category
            .as_deref()
            .map(str::parse::<ErrorCategory>)
            .transpose()
            .map_err(|e| DatabaseError::decode("error_category", e))?;
        let receipt_source = row
            .receipt_source
            .as_deref()
            .map(str::parse::<ReceiptSource>)
            .transpose()
            .map_err(|e| DatabaseError::decode("receipt_source", e))?;

        Ok(PaymentTransaction {
            id: row.id,
            idempotency_key: row.idempotency_key,
            tenant_id: row.tenant_id,
            order_id: row.order_id,
            order_reference: row.order_reference,
            phone_number: row.phone_number,
            amount: row.amount,
            description: row.description,
            merchant_request_id: row.merchant_request_id,
            checkout_request_id: row.checkout_request_id,
            state,
            previous_state,
            status_reason: row.status_reason,
            result_code: row.result_code,
            result_description: row.result_description,
            receipt_number: row.receipt_number,
            receipt_source,
            paid_amount: row.paid_amount,
            created_at: row.created_at,
            submitted_at: row.submitted_at,
            expires_at: row.expires_at,
            callback_received_at: row.callback_received_at,
            completed_at: row.completed_at,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            last_retry_at: row.last_retry_at,
            retry_of: row.retry_of,
            error_message: row.error_message,
            error_category,
            error_retryable: row.error_retryable,
            retry_after_secs: row.retry_after_secs.max(0) as u64,
            query_count: row.query_count.max(0) as u32,
            last_query_at: row.last_query_at,
            recovered_via_query: row.recovered_via_query,
            updated_at: row.updated_at,
        })
    }
}

fn into_domain(rows: Vec<PaymentTransactionRow>) -> Result<Vec<PaymentTransaction>, DatabaseError> {
    rows.into_iter().map(PaymentTransaction::try_from).collect()
}

/// Postgres-backed transaction store.
///
/// Idempotency rides on a partial unique index over `idempotency_key` for
/// key-holding states. Keys older than the window are released in the same
/// database transaction as the insert.
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
    async fn insert_if_absent(
        &self,
        tx: PaymentTransaction,
        window_start: DateTime<Utc>,
    ) -> Result<InsertOutcome, DatabaseError> {
        let mut db_tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        sqlx::query(
            "UPDATE payment_transactions
             SET idempotency_released = TRUE
             WHERE idempotency_key = $1 AND created_at < $2 AND NOT idempotency_released",
        )
        .bind(&tx.idempotency_key)
        .bind(window_start)
        .execute(&mut *db_tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let insert_sql = format!(
            "INSERT INTO payment_transactions ({COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                     $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32,
                     $33, $34, $35)
             ON CONFLICT (idempotency_key)
                WHERE state IN ('created', 'awaiting_confirmation', 'completed')
                  AND NOT idempotency_released
             DO NOTHING
             RETURNING {COLUMNS}"
        );
        let inserted = bind_all(sqlx::query_as::<_, PaymentTransactionRow>(&insert_sql), &tx)
            .fetch_optional(&mut *db_tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let outcome = match inserted {
            Some(row) => InsertOutcome::Inserted(row.try_into()?),
            None => {
                let existing_sql = format!(
                    "SELECT {COLUMNS} FROM payment_transactions
                     WHERE idempotency_key = $1
                       AND state IN ('created', 'awaiting_confirmation', 'completed')
                       AND NOT idempotency_released
                     ORDER BY created_at DESC
                     LIMIT 1"
                );
                let row = sqlx::query_as::<_, PaymentTransactionRow>(&existing_sql)
                    .bind(&tx.idempotency_key)
                    .fetch_optional(&mut *db_tx)
                    .await
                    .map_err(DatabaseError::from_sqlx)?
                    .ok_or_else(|| {
                        DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                            constraint: "payment_transactions_idempotency_key_live".to_string(),
                        })
                    })?;
                InsertOutcome::Existing(row.try_into()?)
            }
        };

        db_tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(outcome)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let sql = format!("SELECT {COLUMNS} FROM payment_transactions WHERE id = $1");
        sqlx::query_as::<_, PaymentTransactionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentTransaction::try_from)
            .transpose()
    }

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM payment_transactions WHERE checkout_request_id = $1"
        );
        sqlx::query_as::<_, PaymentTransactionRow>(&sql)
            .bind(checkout_request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentTransaction::try_from)
            .transpose()
    }

    async fn find_latest_retry(
        &self,
        parent_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM payment_transactions
             WHERE retry_of = $1
             ORDER BY created_at DESC
             LIMIT 1"
        );
        sqlx::query_as::<_, PaymentTransactionRow>(&sql)
            .bind(parent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentTransaction::try_from)
            .transpose()
    }

    async fn update_if_state(
        &self,
        tx: &PaymentTransaction,
        expected: TransactionState,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let sql = format!(
            "UPDATE payment_transactions SET
                merchant_request_id = $2, checkout_request_id = $3, state = $4,
                previous_state = $5, status_reason = $6, result_code = $7,
                result_description = $8, receipt_number = $9, paid_amount = $10,
                submitted_at = $11, expires_at = $12, callback_received_at = $13,
                completed_at = $14, retry_count = $15, last_retry_at = $16,
                error_message = $17, error_category = $18, error_retryable = $19,
                retry_after_secs = $20, query_count = $21, last_query_at = $22,
                recovered_via_query = $23, updated_at = $24, receipt_source = $26
             WHERE id = $1 AND state = $25
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, PaymentTransactionRow>(&sql)
            .bind(tx.id)
            .bind(&tx.merchant_request_id)
            .bind(&tx.checkout_request_id)
            .bind(tx.state.as_str())
            .bind(tx.previous_state.map(|s| s.as_str()))
            .bind(&tx.status_reason)
            .bind(tx.result_code)
            .bind(&tx.result_description)
            .bind(&tx.receipt_number)
            .bind(tx.paid_amount)
            .bind(tx.submitted_at)
            .bind(tx.expires_at)
            .bind(tx.callback_received_at)
            .bind(tx.completed_at)
            .bind(tx.retry_count as i32)
            .bind(tx.last_retry_at)
            .bind(&tx.error_message)
            .bind(tx.error_category.map(|c| c.as_str()))
            .bind(tx.error_retryable)
            .bind(tx.retry_after_secs.min(i64::MAX as u64) as i64)
            .bind(tx.query_count as i32)
            .bind(tx.last_query_at)
            .bind(tx.recovered_via_query)
            .bind(tx.updated_at)
            .bind(expected.as_str())
            .bind(tx.receipt_source.map(|s| s.as_str()))
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentTransaction::try_from)
            .transpose()
    }

    async fn record_query_if_state(
        &self,
        id: Uuid,
        expected: TransactionState,
        queried_at: DateTime<Utc>,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let sql = format!(
            "UPDATE payment_transactions SET
                query_count = query_count + 1, last_query_at = $3, updated_at = $3
             WHERE id = $1 AND state = $2
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, PaymentTransactionRow>(&sql)
            .bind(id)
            .bind(expected.as_str())
            .bind(queried_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentTransaction::try_from)
            .transpose()
    }

    async fn extend_expiry_if_state(
        &self,
        id: Uuid,
        expected: TransactionState,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let sql = format!(
            "UPDATE payment_transactions SET expires_at = $3, updated_at = $4
             WHERE id = $1 AND state = $2 AND expires_at < $3
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, PaymentTransactionRow>(&sql)
            .bind(id)
            .bind(expected.as_str())
            .bind(new_expires_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentTransaction::try_from)
            .transpose()
    }

    async fn list_awaiting_submitted_before(
        &self,
        submitted_before: DateTime<Utc>,
        live_at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>, DatabaseError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM payment_transactions
             WHERE state = 'awaiting_confirmation' AND submitted_at <= $1 AND expires_at > $2
             ORDER BY submitted_at ASC
             LIMIT $3"
        );
        let rows = sqlx::query_as::<_, PaymentTransactionRow>(&sql)
            .bind(submitted_before)
            .bind(live_at)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        into_domain(rows)
    }

    async fn list_expired_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentTransaction>, DatabaseError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM payment_transactions
             WHERE state IN ('created', 'awaiting_confirmation') AND expires_at <= $1
             ORDER BY expires_at ASC
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, PaymentTransactionRow>(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        into_domain(rows)
    }

    async fn list_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>, DatabaseError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM payment_transactions
             WHERE created_at >= $1 AND created_at < $2"
        );
        let rows = sqlx::query_as::<_, PaymentTransactionRow>(&sql)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        into_domain(rows)
    }
}

type RowQuery<'q> =
    sqlx::query::QueryAs<'q, sqlx::Postgres, PaymentTransactionRow, sqlx::postgres::PgArguments>;

fn bind_all<'q>(query: RowQuery<'q>, tx: &'q PaymentTransaction) -> RowQuery<'q> {
    query
        .bind(tx.id)
        .bind(&tx.idempotency_key)
        .bind(&tx.tenant_id)
        .bind(&tx.order_id)
        .bind(&tx.order_reference)
        .bind(&tx.phone_number)
        .bind(tx.amount)
        .bind(&tx.description)
        .bind(&tx.merchant_request_id)
        .bind(&tx.checkout_request_id)
        .bind(tx.state.as_str())
        .bind(tx.previous_state.map(|s| s.as_str()))
        .bind(&tx.status_reason)
        .bind(tx.result_code)
        .bind(&tx.result_description)
        .bind(&tx.receipt_number)
        .bind(tx.receipt_source.map(|s| s.as_str()))
        .bind(tx.paid_amount)
        .bind(tx.created_at)
        .bind(tx.submitted_at)
        .bind(tx.expires_at)
        .bind(tx.callback_received_at)
        .bind(tx.completed_at)
        .bind(tx.retry_count as i32)
        .bind(tx.max_retries as i32)
        .bind(tx.last_retry_at)
        .bind(tx.retry_of)
        .bind(&tx.error_message)
        .bind(tx.error_category.map(|c| c.as_str()))
        .bind(tx.error_retryable)
        .bind(tx.retry_after_secs.min(i64::MAX as u64) as i64)
        .bind(tx.query_count as i32)
        .bind(tx.last_query_at)
        .bind(tx.recovered_via_query)
        .bind(tx.updated_at)
}
