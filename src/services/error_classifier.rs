//! Maps provider result codes onto the failure taxonomy.
//!
//! Pure lookup, no I/O. Unknown codes still classify to something actionable
//! (retryable after a moderate wait) so no failure is ever silently dropped.

use crate::payments::types::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wait applied to codes the table does not know.
pub const UNKNOWN_CODE_RETRY_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub user_message: String,
    pub retry_after: Duration,
}

impl Classification {
    fn new(category: ErrorCategory, retryable: bool, message: &str, wait_secs: u64) -> Self {
        Self {
            category,
            retryable,
            user_message: message.to_string(),
            retry_after: Duration::from_secs(wait_secs),
        }
    }
}

pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(result_code: i32) -> Classification {
        use ErrorCategory::*;

        match result_code {
            1032 => Classification::new(
                UserCancelled,
                true,
                "You cancelled the payment request on your phone.",
                0,
            ),
            1 => Classification::new(
                InsufficientFunds,
                true,
                "Your M-Pesa balance is insufficient for this payment. Top up and try again.",
                60,
            ),
            2 | 3 => Classification::new(
                InvalidInput,
                false,
                "The payment amount is outside the allowed transaction limits.",
                0,
            ),
            4 | 8 | 17 => Classification::new(
                LimitExceeded,
                false,
                "This payment would exceed your M-Pesa transaction or balance limits.",
                0,
            ),
            2001 => Classification::new(
                InvalidInput,
                true,
                "The M-Pesa PIN entered was incorrect. Please try again.",
                0,
            ),
            11 | 2028 => Classification::new(
                InvalidInput,
                false,
                "This M-Pesa account cannot make the requested payment.",
                0,
            ),
            26 | 1025 | 9999 => Classification::new(
                ProviderSystemBusy,
                true,
                "M-Pesa is busy right now. Please try again shortly.",
                60,
            ),
            1001 => Classification::new(
                ProviderSystemBusy,
                true,
                "Another M-Pesa transaction is in progress on your line. Please wait and try again.",
                120,
            ),
            1037 => Classification::new(
                Timeout,
                true,
                "Your phone could not be reached. Make sure it is on and has network coverage.",
                30,
            ),
            1019 => Classification::new(
                Timeout,
                true,
                "The payment request expired before it was completed.",
                0,
            ),
            _ => Classification::new(
                Unknown,
                true,
                "The payment could not be completed. Please try again.",
                UNKNOWN_CODE_RETRY_WAIT.as_secs(),
            ),
        }
    }

    /// Default user message for a stored category when no result code is known.
    pub fn message_for_category(category: ErrorCategory) -> &'static str {
        match category {
            ErrorCategory::UserCancelled => "You cancelled the payment request on your phone.",
            ErrorCategory::InsufficientFunds => "Your M-Pesa balance is insufficient for this payment.",
            ErrorCategory::LimitExceeded => "This payment exceeds your M-Pesa limits.",
            ErrorCategory::InvalidInput => "The payment request was invalid.",
            ErrorCategory::ProviderSystemBusy => "M-Pesa is busy right now. Please try again shortly.",
            ErrorCategory::Timeout => "M-Pesa did not respond in time. Please try again.",
            ErrorCategory::Unknown => "The payment could not be completed. Please try again.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_cancel_is_immediately_retryable() {
        let c = ErrorClassifier::classify(1032);
        assert_eq!(c.category, ErrorCategory::UserCancelled);
        assert!(c.retryable);
        assert_eq!(c.retry_after, Duration::ZERO);
    }

    #[test]
    fn amount_out_of_range_is_not_retryable() {
        for code in [2, 3] {
            let c = ErrorClassifier::classify(code);
            assert_eq!(c.category, ErrorCategory::InvalidInput);
            assert!(!c.retryable, "code {} should not be retryable", code);
        }
    }

    #[test]
    fn busy_and_timeout_codes_carry_a_wait() {
        assert_eq!(
            ErrorClassifier::classify(26).category,
            ErrorCategory::ProviderSystemBusy
        );
        assert_eq!(ErrorClassifier::classify(1001).retry_after, Duration::from_secs(120));
        assert_eq!(ErrorClassifier::classify(1037).category, ErrorCategory::Timeout);
    }

    #[test]
    fn unknown_codes_default_to_retryable_with_moderate_wait() {
        for code in [-1, 5, 424242] {
            let c = ErrorClassifier::classify(code);
            assert_eq!(c.category, ErrorCategory::Unknown);
            assert!(c.retryable);
            assert_eq!(c.retry_after, UNKNOWN_CODE_RETRY_WAIT);
            assert!(!c.user_message.is_empty());
        }
    }
}
