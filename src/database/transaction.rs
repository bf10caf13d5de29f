//! Payment transaction entity and its state machine.

use crate::payments::types::{CorrelationIds, ErrorCategory, ReceiptSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state of a single push payment attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Record inserted, provider not yet contacted
    Created,
    /// Provider accepted the push; waiting for callback or query result
    AwaitingConfirmation,
    Completed,
    Failed,
    /// Deadline passed or cancelled before the provider answered
    Expired,
}

impl TransactionState {
    pub fn valid_transitions(&self) -> &'static [TransactionState] {
        use TransactionState::*;
        match self {
            Created => &[AwaitingConfirmation, Failed, Expired],
            AwaitingConfirmation => &[Completed, Failed, Expired],
            Completed | Failed | Expired => &[],
        }
    }

    pub fn can_transition_to(&self, target: TransactionState) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Completed | TransactionState::Failed | TransactionState::Expired
        )
    }

    /// States that keep the idempotency key reserved.
    pub fn holds_idempotency_key(&self) -> bool {
        matches!(
            self,
            TransactionState::Created
                | TransactionState::AwaitingConfirmation
                | TransactionState::Completed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Created => "created",
            TransactionState::AwaitingConfirmation => "awaiting_confirmation",
            TransactionState::Completed => "completed",
            TransactionState::Failed => "failed",
            TransactionState::Expired => "expired",
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "created" => Ok(TransactionState::Created),
            "awaiting_confirmation" | "pending" => Ok(TransactionState::AwaitingConfirmation),
            "completed" | "success" => Ok(TransactionState::Completed),
            "failed" => Ok(TransactionState::Failed),
            "expired" | "cancelled" => Ok(TransactionState::Expired),
            other => Err(format!("unknown transaction state '{}'", other)),
        }
    }
}

/// Fields supplied when a transaction is first created.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub idempotency_key: String,
    pub tenant_id: String,
    pub order_id: String,
    pub order_reference: String,
    pub phone_number: String,
    pub amount: i64,
    pub description: String,
    pub max_retries: u32,
    pub retry_count: u32,
    pub retry_of: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub idempotency_key: String,

    pub tenant_id: String,
    pub order_id: String,
    pub order_reference: String,

    pub phone_number: String,
    pub amount: i64,
    pub description: String,

    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,

    pub state: TransactionState,
    pub previous_state: Option<TransactionState>,
    /// Why the record reached its current state ("cancelled by user", ...)
    pub status_reason: Option<String>,

    pub result_code: Option<i32>,
    pub result_description: Option<String>,
    pub receipt_number: Option<String>,
    pub receipt_source: Option<ReceiptSource>,
    /// Amount reported by the provider; audit only
    pub paid_amount: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub callback_received_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub retry_of: Option<Uuid>,
    pub error_message: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub error_retryable: bool,
    pub retry_after_secs: u64,

    pub query_count: u32,
    pub last_query_at: Option<DateTime<Utc>>,
    pub recovered_via_query: bool,

    pub updated_at: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn new(fields: NewTransaction, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            idempotency_key: fields.idempotency_key,
            tenant_id: fields.tenant_id,
            order_id: fields.order_id,
            order_reference: fields.order_reference,
            phone_number: fields.phone_number,
            amount: fields.amount,
            description: fields.description,
            merchant_request_id: None,
            checkout_request_id: None,
            state: TransactionState::Created,
            previous_state: None,
            status_reason: None,
            result_code: None,
            result_description: None,
            receipt_number: None,
            receipt_source: None,
            paid_amount: None,
            created_at: now,
            submitted_at: None,
            expires_at: now + ttl,
            callback_received_at: None,
            completed_at: None,
            retry_count: fields.retry_count,
            max_retries: fields.max_retries,
            last_retry_at: fields.retry_of.map(|_| now),
            retry_of: fields.retry_of,
            error_message: None,
            error_category: None,
            error_retryable: false,
            retry_after_secs: 0,
            query_count: 0,
            last_query_at: None,
            recovered_via_query: false,
            updated_at: now,
        }
    }

    pub fn correlation_ids(&self) -> Option<CorrelationIds> {
        match (&self.merchant_request_id, &self.checkout_request_id) {
            (Some(merchant), Some(checkout)) => Some(CorrelationIds {
                merchant_request_id: merchant.clone(),
                checkout_request_id: checkout.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Copy of this record moved to `target`, or the current state when the
    /// move is not allowed. Terminal targets stamp `completed_at`.
    pub fn transitioned(
        &self,
        target: TransactionState,
        now: DateTime<Utc>,
    ) -> Result<Self, TransactionState> {
        if !self.state.can_transition_to(target) {
            return Err(self.state);
        }

        let mut next = self.clone();
        next.previous_state = Some(self.state);
        next.state = target;
        next.updated_at = now;
        if target.is_terminal() {
            next.completed_at = Some(now);
        }
        Ok(next)
    }

    /// Earliest moment a failed record may be retried.
    pub fn retry_not_before(&self) -> DateTime<Utc> {
        let reference = [self.completed_at, self.last_retry_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.created_at);
        let wait = chrono::Duration::seconds(self.retry_after_secs.min(i64::MAX as u64) as i64);
        reference + wait
    }
}
