//! Errors surfaced to callers of the payment lifecycle.
//!
//! Each variant maps to a status code and a stable error code so an outer
//! HTTP or CLI layer can render it without inspecting the message.

use crate::database::error::DatabaseError;
use crate::database::transaction::TransactionState;
use crate::payments::error::PaymentError;
use crate::payments::types::ErrorCategory;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Stable codes for programmatic handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    TransactionNotFound,
    InvalidTransition,
    NonRetryable,
    MaxRetriesExceeded,
    RetryNotYetAllowed,
    PaymentRejected,
    PaymentProviderError,
    DatabaseError,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("transaction {transaction_id} not found")]
    NotFound { transaction_id: String },

    #[error("cannot {operation} transaction {transaction_id} in state {current}")]
    InvalidTransition {
        transaction_id: Uuid,
        current: TransactionState,
        operation: &'static str,
    },

    #[error("transaction {transaction_id} failed with non-retryable category {category}")]
    NonRetryable {
        transaction_id: Uuid,
        category: ErrorCategory,
    },

    #[error("transaction {transaction_id} reached the retry limit ({max_retries})")]
    MaxRetriesExceeded {
        transaction_id: Uuid,
        max_retries: u32,
    },

    #[error("retry for transaction {transaction_id} allowed in {wait_secs}s")]
    RetryNotYetAllowed { transaction_id: Uuid, wait_secs: u64 },

    /// Provider declined the push outright; the record is already FAILED
    #[error("provider rejected transaction {transaction_id}: {source}")]
    Rejected {
        transaction_id: Uuid,
        #[source]
        source: PaymentError,
    },

    /// Provider could not be reached or did not answer in time
    #[error("provider unavailable for transaction {transaction_id:?}: {source}")]
    Transport {
        transaction_id: Option<Uuid>,
        #[source]
        source: PaymentError,
    },

    #[error("store error: {0}")]
    Store(#[from] DatabaseError),
}

impl LifecycleError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        LifecycleError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(id: Uuid) -> Self {
        LifecycleError::NotFound {
            transaction_id: id.to_string(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            LifecycleError::Validation { .. } => 400,
            LifecycleError::NotFound { .. } => 404,
            LifecycleError::InvalidTransition { .. } => 409,
            LifecycleError::NonRetryable { .. } => 422,
            LifecycleError::MaxRetriesExceeded { .. } => 422,
            LifecycleError::RetryNotYetAllowed { .. } => 429,
            LifecycleError::Rejected { .. } => 402,
            LifecycleError::Transport { source, .. } => match source {
                PaymentError::Timeout { .. } => 504,
                PaymentError::RateLimit { .. } => 429,
                _ => 502,
            },
            LifecycleError::Store(_) => 500,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            LifecycleError::Validation { .. } => ErrorCode::ValidationError,
            LifecycleError::NotFound { .. } => ErrorCode::TransactionNotFound,
            LifecycleError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            LifecycleError::NonRetryable { .. } => ErrorCode::NonRetryable,
            LifecycleError::MaxRetriesExceeded { .. } => ErrorCode::MaxRetriesExceeded,
            LifecycleError::RetryNotYetAllowed { .. } => ErrorCode::RetryNotYetAllowed,
            LifecycleError::Rejected { .. } => ErrorCode::PaymentRejected,
            LifecycleError::Transport { .. } => ErrorCode::PaymentProviderError,
            LifecycleError::Store(_) => ErrorCode::DatabaseError,
        }
    }

    /// Message safe to show an end user.
    pub fn user_message(&self) -> String {
        match self {
            LifecycleError::Validation { message, .. } => message.clone(),
            LifecycleError::NotFound { .. } => "Payment not found.".to_string(),
            LifecycleError::InvalidTransition {
                current, operation, ..
            } => format!("This payment is {} and cannot be {}.", current, past_tense(operation)),
            LifecycleError::NonRetryable { .. } => {
                "This payment cannot be retried. Please start a new payment.".to_string()
            }
            LifecycleError::MaxRetriesExceeded { max_retries, .. } => format!(
                "This payment has already been retried {} times. Please start a new payment.",
                max_retries
            ),
            LifecycleError::RetryNotYetAllowed { wait_secs, .. } => {
                format!("Please wait {} seconds before retrying.", wait_secs)
            }
            LifecycleError::Rejected { source, .. } | LifecycleError::Transport { source, .. } => {
                source.user_message()
            }
            LifecycleError::Store(_) => {
                "Something went wrong on our side. Please try again.".to_string()
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            LifecycleError::Transport { .. } | LifecycleError::RetryNotYetAllowed { .. } => true,
            LifecycleError::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}

fn past_tense(operation: &str) -> &str {
    match operation {
        "cancel" => "cancelled",
        "retry" => "retried",
        "extend" => "extended",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_maps_to_conflict() {
        let err = LifecycleError::InvalidTransition {
            transaction_id: Uuid::new_v4(),
            current: TransactionState::Completed,
            operation: "cancel",
        };
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.error_code(), ErrorCode::InvalidTransition);
        assert_eq!(
            err.user_message(),
            "This payment is completed and cannot be cancelled."
        );
    }

    #[test]
    fn transport_timeouts_map_to_gateway_timeout() {
        let err = LifecycleError::Transport {
            transaction_id: None,
            source: PaymentError::Timeout { timeout_secs: 30 },
        };
        assert_eq!(err.status_code(), 504);
        assert!(err.is_retryable());
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::MaxRetriesExceeded).unwrap();
        assert_eq!(json, "\"MAX_RETRIES_EXCEEDED\"");
    }
}
