//! Payment Lifecycle Manager
//!
//! Owns the STK-push state machine: creates transactions under an idempotency
//! key, submits them to the gateway, applies callbacks and query results,
//! and gates cancellation, retries and administrative expiry extensions.
//! Every state change goes through a conditional store update so concurrent
//! writers on one transaction cannot both win.

use crate::database::repository::{InsertOutcome, TransactionStore};
use crate::database::transaction::{NewTransaction, PaymentTransaction, TransactionState};
use crate::error::{LifecycleError, LifecycleResult};
use crate::logging::mask_phone_number;
use crate::payments::error::PaymentError;
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    CallbackAck, CallbackNotification, CorrelationIds, ErrorCategory, PaymentOutcome,
    ReceiptSource, SubmitRequest, SubmitResponse, SUCCESS_RESULT_CODE,
};
use crate::payments::utils::normalize_phone_number;
use crate::services::error_classifier::ErrorClassifier;
use crate::services::notification::{EventNotifier, LifecycleEvent};
use crate::services::settlement::{SettlementRecord, SettlementRecorder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CANCELLED_BY_USER: &str = "cancelled by user";
pub const NO_RESPONSE_RECEIVED: &str = "no response received";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Deadline applied to every new transaction
    pub ttl: Duration,
    pub min_amount: i64,
    pub max_amount: i64,
    pub max_retries: u32,
    /// How long a key keeps suppressing duplicates (24 hours)
    pub idempotency_window: Duration,
    /// Width of the time bucket used when deriving keys
    pub idempotency_bucket: Duration,
    /// Bound on each individual gateway call
    pub gateway_timeout: Duration,
    pub default_description: String,
    /// Overrides the gateway's own callback URL when set
    pub callback_url: Option<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            min_amount: 1,
            max_amount: 150_000,
            max_retries: 3,
            idempotency_window: Duration::from_secs(86400),
            idempotency_bucket: Duration::from_secs(300),
            gateway_timeout: Duration::from_secs(30),
            default_description: "Payment".to_string(),
            callback_url: None,
        }
    }
}

impl LifecycleConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ttl: Duration::from_secs(
                std::env::var("PAYMENT_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            min_amount: std::env::var("PAYMENT_MIN_AMOUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_amount),
            max_amount: std::env::var("PAYMENT_MAX_AMOUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_amount),
            max_retries: std::env::var("PAYMENT_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            idempotency_window: Duration::from_secs(
                std::env::var("IDEMPOTENCY_WINDOW_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(86400),
            ),
            idempotency_bucket: Duration::from_secs(
                std::env::var("IDEMPOTENCY_BUCKET_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            gateway_timeout: Duration::from_secs(
                std::env::var("GATEWAY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            default_description: std::env::var("PAYMENT_DESCRIPTION")
                .unwrap_or(defaults.default_description),
            callback_url: std::env::var("PAYMENT_CALLBACK_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    fn ttl_chrono(&self) -> chrono::Duration {
        to_chrono(self.ttl)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub tenant_id: String,
    pub order_id: String,
    /// Used as the account reference; defaults to the order id
    pub order_reference: Option<String>,
    pub phone_number: String,
    pub amount: i64,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInitiation {
    pub transaction_id: Uuid,
    pub state: TransactionState,
    pub expires_at: DateTime<Utc>,
    pub checkout_request_id: Option<String>,
    pub receipt_number: Option<String>,
    /// True when an existing record was returned instead of a new submission
    pub duplicate: bool,
    pub message: String,
}

impl PaymentInitiation {
    fn from_transaction(tx: &PaymentTransaction, duplicate: bool) -> Self {
        Self {
            transaction_id: tx.id,
            state: tx.state,
            expires_at: tx.expires_at,
            checkout_request_id: tx.checkout_request_id.clone(),
            receipt_number: tx.receipt_number.clone(),
            duplicate,
            message: status_message(tx),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEligibility {
    pub allowed: bool,
    /// Seconds until a retry becomes possible, zero when allowed or never
    pub wait_secs: u64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatus {
    pub transaction: PaymentTransaction,
    pub message: String,
    pub retry: RetryEligibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutcomeSource {
    Callback,
    Query,
}

// ============================================================================
// Idempotency Keys
// ============================================================================

/// Key derived from tenant, order and a coarse time bucket, so repeated
/// requests for the same order inside one bucket collide.
pub fn derive_idempotency_key(
    tenant_id: &str,
    order_id: &str,
    now: DateTime<Utc>,
    bucket: Duration,
) -> String {
    let bucket_secs = bucket.as_secs().max(1) as i64;
    let bucket_index = now.timestamp().div_euclid(bucket_secs);
    hash_key(&format!("{}:{}:{}", tenant_id, order_id, bucket_index))
}

/// Key for a retry of `parent_id`. Concurrent retries of one record collide.
pub fn retry_idempotency_key(tenant_id: &str, order_id: &str, parent_id: Uuid) -> String {
    hash_key(&format!("{}:{}:retry:{}", tenant_id, order_id, parent_id))
}

fn hash_key(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Status Messages
// ============================================================================

fn status_message(tx: &PaymentTransaction) -> String {
    match tx.state {
        TransactionState::Created => "Sending the payment request to your phone.".to_string(),
        TransactionState::AwaitingConfirmation => {
            "Check your phone and enter your M-Pesa PIN to complete the payment.".to_string()
        }
        TransactionState::Completed => match &tx.receipt_number {
            Some(receipt) => format!("Payment received. M-Pesa receipt {}.", receipt),
            None => "Payment received.".to_string(),
        },
        TransactionState::Failed => match (tx.result_code, tx.error_category) {
            (Some(code), _) => ErrorClassifier::classify(code).user_message,
            (None, Some(category)) => ErrorClassifier::message_for_category(category).to_string(),
            (None, None) => "The payment could not be completed.".to_string(),
        },
        TransactionState::Expired => {
            if tx.status_reason.as_deref() == Some(CANCELLED_BY_USER) {
                "The payment was cancelled.".to_string()
            } else {
                "The payment request expired before it was completed.".to_string()
            }
        }
    }
}

fn check_retry(tx: &PaymentTransaction, now: DateTime<Utc>) -> LifecycleResult<()> {
    if tx.state != TransactionState::Failed {
        return Err(LifecycleError::InvalidTransition {
            transaction_id: tx.id,
            current: tx.state,
            operation: "retry",
        });
    }
    if !tx.error_retryable {
        return Err(LifecycleError::NonRetryable {
            transaction_id: tx.id,
            category: tx.error_category.unwrap_or(ErrorCategory::Unknown),
        });
    }
    if tx.retry_count >= tx.max_retries {
        return Err(LifecycleError::MaxRetriesExceeded {
            transaction_id: tx.id,
            max_retries: tx.max_retries,
        });
    }
    let not_before = tx.retry_not_before();
    if now < not_before {
        let remaining = not_before - now;
        let wait_secs = (remaining.num_milliseconds().max(0) as u64).div_ceil(1000);
        return Err(LifecycleError::RetryNotYetAllowed {
            transaction_id: tx.id,
            wait_secs,
        });
    }
    Ok(())
}

/// Whether `tx` could be retried at `now`, for display.
pub fn retry_eligibility(tx: &PaymentTransaction, now: DateTime<Utc>) -> RetryEligibility {
    match check_retry(tx, now) {
        Ok(()) => RetryEligibility {
            allowed: true,
            wait_secs: 0,
            reason: None,
        },
        Err(LifecycleError::RetryNotYetAllowed { wait_secs, .. }) => RetryEligibility {
            allowed: false,
            wait_secs,
            reason: Some(format!("retry allowed in {}s", wait_secs)),
        },
        Err(e) => RetryEligibility {
            allowed: false,
            wait_secs: 0,
            reason: Some(e.user_message()),
        },
    }
}

// ============================================================================
// Lifecycle Manager
// ============================================================================

pub struct PaymentLifecycleManager {
    store: Arc<dyn TransactionStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<EventNotifier>,
    settlement: Arc<dyn SettlementRecorder>,
    config: LifecycleConfig,
}

impl PaymentLifecycleManager {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<EventNotifier>,
        settlement: Arc<dyn SettlementRecorder>,
        config: LifecycleConfig,
    ) -> Self {
        info!(
            provider = %gateway.name(),
            ttl_secs = config.ttl.as_secs(),
            max_retries = config.max_retries,
            "Payment lifecycle manager initialized"
        );
        Self {
            store,
            gateway,
            notifier,
            settlement,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.notifier
    }

    // =========================================================================
    // Payment Initiation
    // =========================================================================

    pub async fn request_payment(
        &self,
        request: PaymentRequest,
    ) -> LifecycleResult<PaymentInitiation> {
        self.request_payment_at(request, Utc::now()).await
    }

    pub async fn request_payment_at(
        &self,
        request: PaymentRequest,
        now: DateTime<Utc>,
    ) -> LifecycleResult<PaymentInitiation> {
        if request.tenant_id.trim().is_empty() {
            return Err(LifecycleError::validation("tenant_id", "tenant id is required"));
        }
        if request.order_id.trim().is_empty() {
            return Err(LifecycleError::validation("order_id", "order id is required"));
        }
        if request.amount < self.config.min_amount || request.amount > self.config.max_amount {
            return Err(LifecycleError::validation(
                "amount",
                format!(
                    "amount must be between {} and {}",
                    self.config.min_amount, self.config.max_amount
                ),
            ));
        }
        let phone_number = normalize_phone(&request.phone_number)?;

        let idempotency_key = match request.idempotency_key {
            Some(key) if key.trim().is_empty() => {
                return Err(LifecycleError::validation(
                    "idempotency_key",
                    "idempotency key must not be empty",
                ));
            }
            Some(key) => key,
            None => derive_idempotency_key(
                &request.tenant_id,
                &request.order_id,
                now,
                self.config.idempotency_bucket,
            ),
        };

        let fields = NewTransaction {
            idempotency_key,
            order_reference: request
                .order_reference
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| request.order_id.clone()),
            tenant_id: request.tenant_id,
            order_id: request.order_id,
            phone_number,
            amount: request.amount,
            description: request
                .description
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| self.config.default_description.clone()),
            max_retries: self.config.max_retries,
            retry_count: 0,
            retry_of: None,
        };

        self.create_and_submit(fields, now).await
    }

    /// Insert under the idempotency key, then submit. An existing live holder
    /// is returned as a duplicate; one already past its deadline is expired
    /// first so the new request can take the key.
    async fn create_and_submit(
        &self,
        fields: NewTransaction,
        now: DateTime<Utc>,
    ) -> LifecycleResult<PaymentInitiation> {
        let window_start = now - to_chrono(self.config.idempotency_window);
        let mut attempts = 0;

        let tx = loop {
            attempts += 1;
            let candidate = PaymentTransaction::new(fields.clone(), now, self.config.ttl_chrono());

            match self.store.insert_if_absent(candidate, window_start).await? {
                InsertOutcome::Inserted(tx) => break tx,
                InsertOutcome::Existing(existing) => {
                    let stale = !existing.is_terminal() && existing.is_past_deadline(now);
                    if stale && attempts < 2 {
                        self.expire_transaction(&existing, NO_RESPONSE_RECEIVED, now)
                            .await?;
                        continue;
                    }
                    info!(
                        transaction_id = %existing.id,
                        state = %existing.state,
                        "Returning existing transaction for idempotency key"
                    );
                    return Ok(PaymentInitiation::from_transaction(&existing, true));
                }
            }
        };

        info!(
            transaction_id = %tx.id,
            tenant_id = %tx.tenant_id,
            order_id = %tx.order_id,
            amount = tx.amount,
            phone = %mask_phone_number(&tx.phone_number),
            retry_of = ?tx.retry_of,
            "Payment transaction created"
        );
        self.emit(&tx, json!({ "amount": tx.amount, "order_id": tx.order_id }));

        self.submit(tx, now).await
    }

    async fn submit(
        &self,
        tx: PaymentTransaction,
        now: DateTime<Utc>,
    ) -> LifecycleResult<PaymentInitiation> {
        let request = SubmitRequest {
            phone_number: tx.phone_number.clone(),
            amount: tx.amount,
            account_reference: tx.order_reference.clone(),
            description: tx.description.clone(),
            callback_url: self.config.callback_url.clone(),
        };

        let result = match tokio::time::timeout(
            self.config.gateway_timeout,
            self.gateway.submit(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PaymentError::Timeout {
                timeout_secs: self.config.gateway_timeout.as_secs(),
            }),
        };

        match result {
            Ok(SubmitResponse::Accepted {
                correlation_ids, ..
            }) => self.mark_awaiting(tx, correlation_ids, now).await,
            Ok(SubmitResponse::Rejected { code, message }) => {
                let err = PaymentError::Rejected {
                    message,
                    provider_code: code,
                };
                self.fail_at_submit(&tx, &err, now).await?;
                Err(LifecycleError::Rejected {
                    transaction_id: tx.id,
                    source: err,
                })
            }
            Err(err) => {
                self.fail_at_submit(&tx, &err, now).await?;
                if err.is_transport() {
                    Err(LifecycleError::Transport {
                        transaction_id: Some(tx.id),
                        source: err,
                    })
                } else {
                    Err(LifecycleError::Rejected {
                        transaction_id: tx.id,
                        source: err,
                    })
                }
            }
        }
    }

    async fn mark_awaiting(
        &self,
        tx: PaymentTransaction,
        ids: CorrelationIds,
        now: DateTime<Utc>,
    ) -> LifecycleResult<PaymentInitiation> {
        let mut next = self.transition(&tx, TransactionState::AwaitingConfirmation, now, "submit")?;
        next.merchant_request_id = Some(ids.merchant_request_id.clone());
        next.checkout_request_id = Some(ids.checkout_request_id.clone());
        next.submitted_at = Some(now);

        match self.commit(&next, tx.state).await? {
            Some(saved) => {
                self.emit(&saved, json!({ "checkout_request_id": ids.checkout_request_id }));
                Ok(PaymentInitiation::from_transaction(&saved, false))
            }
            None => {
                // Cancelled or expired while the gateway call was in flight. The
                // customer may still pay, so keep the ids for tracing.
                let current = self.load(tx.id).await?;
                error!(
                    transaction_id = %tx.id,
                    merchant_request_id = %ids.merchant_request_id,
                    checkout_request_id = %ids.checkout_request_id,
                    state = %current.state,
                    "Provider accepted a transaction that already left CREATED"
                );
                let mut traced = current.clone();
                traced.merchant_request_id = Some(ids.merchant_request_id);
                traced.checkout_request_id = Some(ids.checkout_request_id);
                traced.submitted_at = Some(now);
                traced.updated_at = now;
                let current = self
                    .store
                    .update_if_state(&traced, current.state)
                    .await?
                    .unwrap_or(current);
                Ok(PaymentInitiation::from_transaction(&current, false))
            }
        }
    }

    async fn fail_at_submit(
        &self,
        tx: &PaymentTransaction,
        err: &PaymentError,
        now: DateTime<Utc>,
    ) -> LifecycleResult<()> {
        warn!(
            transaction_id = %tx.id,
            error = %err,
            transport = err.is_transport(),
            "Payment submission failed"
        );

        let mut next = self.transition(tx, TransactionState::Failed, now, "fail")?;
        next.status_reason = Some("submission failed".to_string());
        next.error_message = Some(err.to_string());
        next.error_category = Some(err.category());
        next.error_retryable = err.is_retryable();
        next.retry_after_secs = err.retry_after_secs();

        if let Some(saved) = self.commit(&next, tx.state).await? {
            self.emit(
                &saved,
                json!({
                    "category": saved.error_category,
                    "message": saved.error_message,
                    "retryable": saved.error_retryable,
                }),
            );
        }
        Ok(())
    }

    // =========================================================================
    // Callback Handling
    // =========================================================================

    /// Parse and apply a raw callback body. Always acknowledges.
    pub async fn handle_callback_payload(&self, payload: &[u8]) -> CallbackAck {
        match CallbackNotification::from_payload(payload) {
            Ok(notification) => self.handle_callback(notification).await,
            Err(e) => {
                warn!(error = %e, "Discarding malformed payment callback");
                CallbackAck::accepted()
            }
        }
    }

    pub async fn handle_callback(&self, notification: CallbackNotification) -> CallbackAck {
        self.handle_callback_at(notification, Utc::now()).await
    }

    /// Apply a provider callback. The record is found by checkout request id
    /// only; tenant and amount fields in the body are logged, never trusted.
    pub async fn handle_callback_at(
        &self,
        notification: CallbackNotification,
        now: DateTime<Utc>,
    ) -> CallbackAck {
        if let Err(e) = self.apply_callback(&notification, now).await {
            error!(
                checkout_request_id = %notification.checkout_request_id,
                error = %e,
                "Failed to process payment callback"
            );
        }
        CallbackAck::accepted()
    }

    async fn apply_callback(
        &self,
        notification: &CallbackNotification,
        now: DateTime<Utc>,
    ) -> LifecycleResult<()> {
        let tx = match self
            .store
            .find_by_checkout_request_id(&notification.checkout_request_id)
            .await?
        {
            Some(tx) => tx,
            None => {
                warn!(
                    checkout_request_id = %notification.checkout_request_id,
                    result_code = notification.result_code,
                    "Callback for unknown checkout request discarded"
                );
                return Ok(());
            }
        };

        if tx.state == TransactionState::Expired
            && notification.result_code == SUCCESS_RESULT_CODE
        {
            error!(
                transaction_id = %tx.id,
                checkout_request_id = %notification.checkout_request_id,
                receipt = ?notification.metadata.receipt_number,
                status_reason = ?tx.status_reason,
                "Provider confirmed payment for an expired transaction; manual review needed"
            );
            return Ok(());
        }

        if tx.state != TransactionState::AwaitingConfirmation {
            info!(
                transaction_id = %tx.id,
                state = %tx.state,
                result_code = notification.result_code,
                "Duplicate or late callback ignored"
            );
            return Ok(());
        }

        if tx.merchant_request_id.as_deref() != Some(notification.merchant_request_id.as_str()) {
            warn!(
                transaction_id = %tx.id,
                callback_merchant_request_id = %notification.merchant_request_id,
                "Callback merchant request id does not match stored value"
            );
        }

        let mut tx = tx;
        tx.callback_received_at = Some(now);
        self.apply_outcome(
            tx,
            notification.to_outcome(),
            Some(notification.result_description.as_str()),
            OutcomeSource::Callback,
            now,
        )
        .await?;
        Ok(())
    }

    // =========================================================================
    // Outcome Application
    // =========================================================================

    /// Drive an AWAITING record forward from a callback or query result.
    /// Returns the record as stored afterwards; a lost race is a no-op.
    async fn apply_outcome(
        &self,
        tx: PaymentTransaction,
        outcome: PaymentOutcome,
        description: Option<&str>,
        source: OutcomeSource,
        now: DateTime<Utc>,
    ) -> LifecycleResult<PaymentTransaction> {
        let expected = tx.state;

        match outcome {
            PaymentOutcome::Success {
                receipt,
                receipt_source,
                amount,
                phone_number,
            } => {
                let mut next = self.transition(&tx, TransactionState::Completed, now, "complete")?;
                next.receipt_number = Some(receipt);
                next.receipt_source = Some(receipt_source);
                next.paid_amount = amount;
                next.result_code = Some(0);
                next.result_description = description.map(str::to_string);
                next.recovered_via_query = source == OutcomeSource::Query;

                if let Some(paid) = amount.filter(|paid| *paid != tx.amount) {
                    warn!(
                        transaction_id = %tx.id,
                        requested = tx.amount,
                        reported = paid,
                        "Provider reported a different amount than requested"
                    );
                }
                if let Some(phone) = phone_number {
                    debug!(
                        transaction_id = %tx.id,
                        payer = %mask_phone_number(&phone),
                        "Payer reported by provider"
                    );
                }

                match self.commit(&next, expected).await? {
                    Some(saved) => {
                        self.emit(
                            &saved,
                            json!({
                                "receipt": saved.receipt_number,
                                "receipt_source": saved.receipt_source,
                                "amount": saved.amount,
                                "recovered_via_query": saved.recovered_via_query,
                            }),
                        );
                        self.record_settlement(&saved, now).await;
                        Ok(saved)
                    }
                    None => self.discarded(tx.id, source).await,
                }
            }
            PaymentOutcome::Failure {
                category,
                code,
                message,
            } => {
                let classification = ErrorClassifier::classify(code);
                let mut next = self.transition(&tx, TransactionState::Failed, now, "fail")?;
                next.result_code = Some(code);
                next.result_description = Some(message.clone());
                next.status_reason = Some(classification.user_message.clone());
                next.error_message = Some(message);
                next.error_category = Some(category);
                next.error_retryable = classification.retryable;
                next.retry_after_secs = classification.retry_after.as_secs();

                match self.commit(&next, expected).await? {
                    Some(saved) => {
                        self.emit(
                            &saved,
                            json!({
                                "category": category,
                                "code": code,
                                "message": saved.result_description,
                                "retryable": saved.error_retryable,
                            }),
                        );
                        Ok(saved)
                    }
                    None => self.discarded(tx.id, source).await,
                }
            }
            PaymentOutcome::StillProcessing => {
                // Interim answers only touch query bookkeeping
                let saved = match source {
                    OutcomeSource::Query => {
                        self.store
                            .record_query_if_state(tx.id, expected, now)
                            .await?
                    }
                    OutcomeSource::Callback => None,
                };
                match saved {
                    Some(saved) => {
                        debug!(
                            transaction_id = %saved.id,
                            query_count = saved.query_count,
                            "Provider still processing"
                        );
                        Ok(saved)
                    }
                    None => self.discarded(tx.id, source).await,
                }
            }
        }
    }

    async fn discarded(
        &self,
        transaction_id: Uuid,
        source: OutcomeSource,
    ) -> LifecycleResult<PaymentTransaction> {
        let current = self.load(transaction_id).await?;
        info!(
            transaction_id = %transaction_id,
            state = %current.state,
            source = ?source,
            "Concurrent transition won; outcome discarded"
        );
        Ok(current)
    }

    async fn record_settlement(&self, tx: &PaymentTransaction, now: DateTime<Utc>) {
        let Some(receipt) = tx.receipt_number.clone() else {
            return;
        };
        let settlement = SettlementRecord {
            transaction_id: tx.id,
            tenant_id: tx.tenant_id.clone(),
            order_id: tx.order_id.clone(),
            amount: tx.amount,
            receipt,
            receipt_source: tx.receipt_source.unwrap_or(ReceiptSource::Provider),
            phone_number: tx.phone_number.clone(),
            settled_at: now,
        };
        if let Err(e) = self.settlement.record(&settlement).await {
            error!(
                transaction_id = %tx.id,
                error = %e,
                "Settlement recording failed; transaction stays COMPLETED"
            );
        }
    }

    // =========================================================================
    // Status Query
    // =========================================================================

    pub async fn query(&self, transaction_id: Uuid) -> LifecycleResult<PaymentTransaction> {
        self.query_at(transaction_id, Utc::now()).await
    }

    /// Force an immediate status check. Records not awaiting confirmation are
    /// returned unchanged.
    pub async fn query_at(
        &self,
        transaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> LifecycleResult<PaymentTransaction> {
        let tx = self.load(transaction_id).await?;
        if tx.state != TransactionState::AwaitingConfirmation {
            return Ok(tx);
        }
        self.reconcile_with_query(tx, now).await
    }

    /// Ask the gateway about an AWAITING record and apply the answer.
    /// Transport failures leave the record untouched and are returned.
    pub async fn reconcile_with_query(
        &self,
        tx: PaymentTransaction,
        now: DateTime<Utc>,
    ) -> LifecycleResult<PaymentTransaction> {
        let ids = tx.correlation_ids().ok_or(LifecycleError::InvalidTransition {
            transaction_id: tx.id,
            current: tx.state,
            operation: "query",
        })?;

        let result =
            match tokio::time::timeout(self.config.gateway_timeout, self.gateway.query(&ids)).await
            {
                Ok(result) => result,
                Err(_) => Err(PaymentError::Timeout {
                    timeout_secs: self.config.gateway_timeout.as_secs(),
                }),
            };

        let outcome = result.map_err(|source| LifecycleError::Transport {
            transaction_id: Some(tx.id),
            source,
        })?;

        let description = match &outcome {
            PaymentOutcome::Failure { message, .. } => Some(message.clone()),
            _ => None,
        };

        // The snapshot may predate writes made while the query was in flight.
        let mut tx = self.load(tx.id).await?;
        if tx.state != TransactionState::AwaitingConfirmation {
            return self.discarded(tx.id, OutcomeSource::Query).await;
        }
        tx.query_count += 1;
        tx.last_query_at = Some(now);
        self.apply_outcome(tx, outcome, description.as_deref(), OutcomeSource::Query, now)
            .await
    }

    // =========================================================================
    // Cancellation, Expiry & Retry
    // =========================================================================

    pub async fn cancel(&self, transaction_id: Uuid) -> LifecycleResult<PaymentTransaction> {
        self.cancel_at(transaction_id, Utc::now()).await
    }

    pub async fn cancel_at(
        &self,
        transaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> LifecycleResult<PaymentTransaction> {
        let tx = self.load(transaction_id).await?;
        if tx.is_terminal() {
            return Err(LifecycleError::InvalidTransition {
                transaction_id,
                current: tx.state,
                operation: "cancel",
            });
        }

        match self.expire_transaction(&tx, CANCELLED_BY_USER, now).await? {
            Some(saved) => Ok(saved),
            None => {
                let current = self.load(transaction_id).await?;
                Err(LifecycleError::InvalidTransition {
                    transaction_id,
                    current: current.state,
                    operation: "cancel",
                })
            }
        }
    }

    /// Move a non-terminal record to EXPIRED. `None` when it is terminal or
    /// another writer moved it first.
    pub async fn expire_transaction(
        &self,
        tx: &PaymentTransaction,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Option<PaymentTransaction>> {
        let Ok(mut next) = tx.transitioned(TransactionState::Expired, now) else {
            return Ok(None);
        };
        next.status_reason = Some(reason.to_string());

        let saved = self.commit(&next, tx.state).await?;
        if let Some(saved) = &saved {
            self.emit(saved, json!({ "reason": reason }));
        }
        Ok(saved)
    }

    pub async fn extend_expiry(
        &self,
        transaction_id: Uuid,
        new_expires_at: DateTime<Utc>,
    ) -> LifecycleResult<PaymentTransaction> {
        self.extend_expiry_at(transaction_id, new_expires_at, Utc::now())
            .await
    }

    /// Push the deadline of a non-terminal record later, for recovery. Only
    /// the deadline column is written.
    pub async fn extend_expiry_at(
        &self,
        transaction_id: Uuid,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> LifecycleResult<PaymentTransaction> {
        loop {
            let tx = self.load(transaction_id).await?;
            if tx.is_terminal() {
                return Err(LifecycleError::InvalidTransition {
                    transaction_id,
                    current: tx.state,
                    operation: "extend",
                });
            }
            if new_expires_at <= tx.expires_at {
                return Err(LifecycleError::validation(
                    "expires_at",
                    "new deadline must be later than the current one",
                ));
            }

            // `None` means the state moved underneath us; re-check and try again.
            if let Some(saved) = self
                .store
                .extend_expiry_if_state(transaction_id, tx.state, new_expires_at, now)
                .await?
            {
                info!(
                    transaction_id = %transaction_id,
                    old_expires_at = %tx.expires_at,
                    new_expires_at = %new_expires_at,
                    "Transaction deadline extended"
                );
                return Ok(saved);
            }
        }
    }

    pub async fn retry(
        &self,
        transaction_id: Uuid,
        new_phone_number: Option<String>,
    ) -> LifecycleResult<PaymentInitiation> {
        self.retry_at(transaction_id, new_phone_number, Utc::now())
            .await
    }

    /// Create and submit a fresh transaction for a FAILED one. The failed
    /// record is left as history; each record can be retried once.
    pub async fn retry_at(
        &self,
        transaction_id: Uuid,
        new_phone_number: Option<String>,
        now: DateTime<Utc>,
    ) -> LifecycleResult<PaymentInitiation> {
        let failed = self.load(transaction_id).await?;
        check_retry(&failed, now)?;

        if let Some(existing) = self.store.find_latest_retry(failed.id).await? {
            if existing.state.holds_idempotency_key() {
                info!(
                    transaction_id = %failed.id,
                    retry_id = %existing.id,
                    "Returning in-flight retry"
                );
                return Ok(PaymentInitiation::from_transaction(&existing, true));
            }
            return Err(LifecycleError::InvalidTransition {
                transaction_id: failed.id,
                current: failed.state,
                operation: "retry",
            });
        }

        let phone_number = match new_phone_number {
            Some(phone) => normalize_phone(&phone)?,
            None => failed.phone_number.clone(),
        };

        // A submission the provider never accepted does not use a slot.
        let retry_count = failed.retry_count + u32::from(failed.submitted_at.is_some());

        info!(
            transaction_id = %failed.id,
            retry_count,
            max_retries = failed.max_retries,
            "Retrying failed payment"
        );

        let fields = NewTransaction {
            idempotency_key: retry_idempotency_key(&failed.tenant_id, &failed.order_id, failed.id),
            tenant_id: failed.tenant_id.clone(),
            order_id: failed.order_id.clone(),
            order_reference: failed.order_reference.clone(),
            phone_number,
            amount: failed.amount,
            description: failed.description.clone(),
            max_retries: failed.max_retries,
            retry_count,
            retry_of: Some(failed.id),
        };
        self.create_and_submit(fields, now).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get_state(&self, transaction_id: Uuid) -> LifecycleResult<TransactionStatus> {
        self.get_state_at(transaction_id, Utc::now()).await
    }

    pub async fn get_state_at(
        &self,
        transaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> LifecycleResult<TransactionStatus> {
        let transaction = self.load(transaction_id).await?;
        Ok(TransactionStatus {
            message: status_message(&transaction),
            retry: retry_eligibility(&transaction, now),
            transaction,
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn load(&self, transaction_id: Uuid) -> LifecycleResult<PaymentTransaction> {
        self.store
            .find_by_id(transaction_id)
            .await?
            .ok_or_else(|| LifecycleError::not_found(transaction_id))
    }

    fn transition(
        &self,
        tx: &PaymentTransaction,
        target: TransactionState,
        now: DateTime<Utc>,
        operation: &'static str,
    ) -> LifecycleResult<PaymentTransaction> {
        tx.transitioned(target, now)
            .map_err(|current| LifecycleError::InvalidTransition {
                transaction_id: tx.id,
                current,
                operation,
            })
    }

    /// Conditional write; logs the transition when it lands.
    async fn commit(
        &self,
        next: &PaymentTransaction,
        expected: TransactionState,
    ) -> LifecycleResult<Option<PaymentTransaction>> {
        let saved = self.store.update_if_state(next, expected).await?;
        if saved.is_some() {
            info!(
                transaction_id = %next.id,
                from_state = %expected,
                to_state = %next.state,
                "Transaction state transitioned"
            );
        }
        Ok(saved)
    }

    fn emit(&self, tx: &PaymentTransaction, details: JsonValue) {
        self.notifier
            .publish(LifecycleEvent::from_transaction(tx, details));
    }
}

fn normalize_phone(raw: &str) -> LifecycleResult<String> {
    normalize_phone_number(raw).map_err(|e| match e {
        PaymentError::Validation { message, .. } => {
            LifecycleError::validation("phone_number", message)
        }
        other => LifecycleError::validation("phone_number", other.to_string()),
    })
}
