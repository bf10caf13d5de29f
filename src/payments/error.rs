use crate::payments::types::ErrorCategory;
use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

/// Errors talking to the payment provider. Everything except `Rejected` and
/// `Validation` is a transport-level failure: the provider never gave a
/// business answer.
#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Provider call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Authentication with provider failed: {message}")]
    Authentication { message: String },

    #[error("Request rejected by provider: {message}")]
    Rejected {
        message: String,
        provider_code: Option<String>,
    },

    #[error("Provider error: provider={provider}, message={message}")]
    Provider {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::Validation { .. } => false,
            PaymentError::Network { .. } => true,
            PaymentError::Timeout { .. } => true,
            PaymentError::RateLimit { .. } => true,
            PaymentError::Authentication { .. } => true,
            PaymentError::Rejected { .. } => false,
            PaymentError::Provider { retryable, .. } => *retryable,
        }
    }

    /// True when the provider never returned a business answer.
    pub fn is_transport(&self) -> bool {
        !matches!(
            self,
            PaymentError::Rejected { .. } | PaymentError::Validation { .. }
        )
    }

    pub fn provider_code(&self) -> Option<&str> {
        match self {
            PaymentError::Rejected { provider_code, .. }
            | PaymentError::Provider { provider_code, .. } => provider_code.as_deref(),
            _ => None,
        }
    }

    /// Category recorded on a transaction that failed at submit time.
    pub fn category(&self) -> ErrorCategory {
        match self {
            PaymentError::Validation { .. } | PaymentError::Rejected { .. } => {
                ErrorCategory::InvalidInput
            }
            PaymentError::Timeout { .. } | PaymentError::Network { .. } => ErrorCategory::Timeout,
            PaymentError::RateLimit { .. } | PaymentError::Authentication { .. } => {
                ErrorCategory::ProviderSystemBusy
            }
            PaymentError::Provider { retryable: true, .. } => ErrorCategory::ProviderSystemBusy,
            PaymentError::Provider { .. } => ErrorCategory::Unknown,
        }
    }

    /// Suggested wait before the caller tries again.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            PaymentError::RateLimit {
                retry_after_seconds: Some(secs),
                ..
            } => *secs,
            PaymentError::RateLimit { .. } | PaymentError::Authentication { .. } => 60,
            PaymentError::Network { .. } | PaymentError::Timeout { .. } => 30,
            PaymentError::Provider { retryable: true, .. } => 60,
            _ => 0,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::Validation { message, .. } => message.clone(),
            PaymentError::Network { .. } | PaymentError::Timeout { .. } => {
                "Payment provider is temporarily unavailable".to_string()
            }
            PaymentError::RateLimit { .. } => {
                "Too many requests to payment provider. Please retry shortly".to_string()
            }
            PaymentError::Authentication { .. } => {
                "Payment provider is temporarily unavailable".to_string()
            }
            PaymentError::Rejected { message, .. } => {
                format!("Payment request was declined: {}", message)
            }
            PaymentError::Provider { .. } => "Payment provider returned an error".to_string(),
        }
    }
}
