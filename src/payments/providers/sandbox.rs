//! Provider double that fabricates responses from well-known test numbers.
//!
//! Used by the test suite and by the binary when `MPESA_ENVIRONMENT=simulation`.
//! Behaviour beyond the number table (query outages, submit failures, slow
//! submits) is switched at runtime through the setters.

use crate::logging::mask_phone_number;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    CallbackMetadata, CallbackNotification, CorrelationIds, PaymentOutcome, ProviderName,
    SubmitRequest, SubmitResponse, SUCCESS_RESULT_CODE,
};
use crate::services::error_classifier::ErrorClassifier;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub const SUCCESS_NUMBER: &str = "254708374149";
pub const INSUFFICIENT_FUNDS_NUMBER: &str = "254700000001";
pub const USER_CANCELLED_NUMBER: &str = "254700000032";
pub const UNREACHABLE_NUMBER: &str = "254700000037";
pub const REJECTED_NUMBER: &str = "254700000099";

/// How the status query answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxQueryMode {
    /// Answer with the outcome the number table dictates
    Resolve,
    StillProcessing,
    /// Every query fails with a network error
    Unavailable,
}

#[derive(Debug, Clone)]
struct SandboxBehaviour {
    query_mode: SandboxQueryMode,
    submit_failure: Option<PaymentError>,
    submit_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
struct SubmittedPush {
    phone_number: String,
    amount: i64,
    merchant_request_id: String,
}

pub struct SandboxGateway {
    behaviour: RwLock<SandboxBehaviour>,
    submitted: RwLock<HashMap<String, SubmittedPush>>,
    submit_calls: AtomicUsize,
    query_calls: AtomicUsize,
}

impl Default for SandboxGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self {
            behaviour: RwLock::new(SandboxBehaviour {
                query_mode: SandboxQueryMode::Resolve,
                submit_failure: None,
                submit_delay: None,
            }),
            submitted: RwLock::new(HashMap::new()),
            submit_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
        }
    }

    pub async fn set_query_mode(&self, mode: SandboxQueryMode) {
        self.behaviour.write().await.query_mode = mode;
    }

    /// Make every submit fail with `failure` until cleared with `None`.
    pub async fn set_submit_failure(&self, failure: Option<PaymentError>) {
        self.behaviour.write().await.submit_failure = failure;
    }

    pub async fn set_submit_delay(&self, delay: Option<Duration>) {
        self.behaviour.write().await.submit_delay = delay;
    }

    pub fn submit_count(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// The callback the provider would deliver for an accepted push, or `None`
    /// if the checkout id was never issued by this gateway.
    pub async fn simulate_callback(
        &self,
        correlation_ids: &CorrelationIds,
    ) -> Option<CallbackNotification> {
        let submitted = self.submitted.read().await;
        let push = submitted.get(&correlation_ids.checkout_request_id)?;
        let result_code = result_code_for(&push.phone_number);

        let metadata = if result_code == SUCCESS_RESULT_CODE {
            CallbackMetadata {
                receipt_number: Some(receipt_for(&correlation_ids.checkout_request_id)),
                amount: Some(push.amount),
                phone_number: Some(push.phone_number.clone()),
                transaction_date: Some(Utc::now().format("%Y%m%d%H%M%S").to_string()),
            }
        } else {
            CallbackMetadata::default()
        };

        Some(CallbackNotification {
            merchant_request_id: push.merchant_request_id.clone(),
            checkout_request_id: correlation_ids.checkout_request_id.clone(),
            result_code,
            result_description: result_description(result_code),
            metadata,
        })
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn submit(&self, request: SubmitRequest) -> PaymentResult<SubmitResponse> {
        let sequence = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let behaviour = self.behaviour.read().await.clone();

        if let Some(delay) = behaviour.submit_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = behaviour.submit_failure {
            return Err(failure);
        }

        if request.phone_number == REJECTED_NUMBER {
            return Ok(SubmitResponse::Rejected {
                code: Some("400.002.02".to_string()),
                message: "Bad Request - Invalid PhoneNumber".to_string(),
            });
        }

        let correlation_ids = CorrelationIds {
            merchant_request_id: format!("{}-{}-1", 29115 + sequence, sequence),
            checkout_request_id: format!("ws_CO_{}", Uuid::new_v4().simple()),
        };
        debug!(
            phone = %mask_phone_number(&request.phone_number),
            checkout_request_id = %correlation_ids.checkout_request_id,
            "sandbox accepted STK push"
        );

        self.submitted.write().await.insert(
            correlation_ids.checkout_request_id.clone(),
            SubmittedPush {
                phone_number: request.phone_number,
                amount: request.amount,
                merchant_request_id: correlation_ids.merchant_request_id.clone(),
            },
        );

        Ok(SubmitResponse::Accepted {
            correlation_ids,
            customer_message: Some("Success. Request accepted for processing".to_string()),
        })
    }

    async fn query(&self, correlation_ids: &CorrelationIds) -> PaymentResult<PaymentOutcome> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);

        match self.behaviour.read().await.query_mode {
            SandboxQueryMode::Unavailable => {
                return Err(PaymentError::Network {
                    message: "sandbox query endpoint unavailable".to_string(),
                })
            }
            SandboxQueryMode::StillProcessing => return Ok(PaymentOutcome::StillProcessing),
            SandboxQueryMode::Resolve => {}
        }

        let submitted = self.submitted.read().await;
        let push = submitted
            .get(&correlation_ids.checkout_request_id)
            .ok_or_else(|| PaymentError::Provider {
                provider: ProviderName::Sandbox.to_string(),
                message: "unknown CheckoutRequestID".to_string(),
                provider_code: Some("400.002.02".to_string()),
                retryable: false,
            })?;

        let result_code = result_code_for(&push.phone_number);
        Ok(PaymentOutcome::from_result(
            result_code,
            &result_description(result_code),
            Some(receipt_for(&correlation_ids.checkout_request_id)),
            Some(push.amount),
            Some(push.phone_number.clone()),
            &correlation_ids.checkout_request_id,
        ))
    }

    fn name(&self) -> ProviderName {
        ProviderName::Sandbox
    }
}

fn result_code_for(phone_number: &str) -> i32 {
    match phone_number {
        INSUFFICIENT_FUNDS_NUMBER => 1,
        USER_CANCELLED_NUMBER => 1032,
        UNREACHABLE_NUMBER => 1037,
        _ => SUCCESS_RESULT_CODE,
    }
}

fn result_description(result_code: i32) -> String {
    if result_code == SUCCESS_RESULT_CODE {
        "The service request is processed successfully.".to_string()
    } else {
        ErrorClassifier::classify(result_code).user_message
    }
}

fn receipt_for(checkout_request_id: &str) -> String {
    let tail: String = checkout_request_id
        .chars()
        .rev()
        .take(8)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("SBX{}", tail.to_uppercase())
}
