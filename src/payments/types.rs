use crate::payments::error::PaymentError;
use crate::services::error_classifier::ErrorClassifier;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

/// Result code the provider uses for a successful payment.
pub const SUCCESS_RESULT_CODE: i32 = 0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    Mpesa,
    Sandbox,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Mpesa => "mpesa",
            ProviderName::Sandbox => "sandbox",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "mpesa" | "m-pesa" => Ok(ProviderName::Mpesa),
            "sandbox" | "simulation" => Ok(ProviderName::Sandbox),
            _ => Err(PaymentError::Validation {
                message: format!("unsupported provider: {}", value),
                field: Some("provider".to_string()),
            }),
        }
    }
}

/// Failure taxonomy shared by provider result codes and submit failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    UserCancelled,
    InsufficientFunds,
    LimitExceeded,
    InvalidInput,
    ProviderSystemBusy,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::UserCancelled => "user_cancelled",
            ErrorCategory::InsufficientFunds => "insufficient_funds",
            ErrorCategory::LimitExceeded => "limit_exceeded",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::ProviderSystemBusy => "provider_system_busy",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user_cancelled" => Ok(ErrorCategory::UserCancelled),
            "insufficient_funds" => Ok(ErrorCategory::InsufficientFunds),
            "limit_exceeded" => Ok(ErrorCategory::LimitExceeded),
            "invalid_input" => Ok(ErrorCategory::InvalidInput),
            "provider_system_busy" => Ok(ErrorCategory::ProviderSystemBusy),
            "timeout" => Ok(ErrorCategory::Timeout),
            "unknown" => Ok(ErrorCategory::Unknown),
            other => Err(format!("unknown error category: {}", other)),
        }
    }
}

/// Where a completed payment's receipt came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptSource {
    /// Receipt number issued by the provider
    Provider,
    /// No receipt was reported; the checkout request id stands in
    CheckoutRequest,
}

impl ReceiptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptSource::Provider => "provider",
            ReceiptSource::CheckoutRequest => "checkout_request",
        }
    }
}

impl std::fmt::Display for ReceiptSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReceiptSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "provider" => Ok(ReceiptSource::Provider),
            "checkout_request" => Ok(ReceiptSource::CheckoutRequest),
            other => Err(format!("unknown receipt source: {}", other)),
        }
    }
}

/// Provider-assigned identifiers returned when a push request is accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrelationIds {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Normalized subscriber number (2547XXXXXXXX / 2541XXXXXXXX)
    pub phone_number: String,
    pub amount: i64,
    pub account_reference: String,
    pub description: String,
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitResponse {
    Accepted {
        correlation_ids: CorrelationIds,
        customer_message: Option<String>,
    },
    Rejected {
        code: Option<String>,
        message: String,
    },
}

/// Final or interim answer about a push request, from a callback or a status query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Success {
        receipt: String,
        receipt_source: ReceiptSource,
        amount: Option<i64>,
        phone_number: Option<String>,
    },
    Failure {
        category: ErrorCategory,
        code: i32,
        message: String,
    },
    StillProcessing,
}

impl PaymentOutcome {
    /// Build an outcome from a provider result code. A success without a receipt
    /// falls back to the checkout request id, marked as a stand-in.
    pub fn from_result(
        result_code: i32,
        result_description: &str,
        receipt: Option<String>,
        amount: Option<i64>,
        phone_number: Option<String>,
        checkout_request_id: &str,
    ) -> Self {
        if result_code == SUCCESS_RESULT_CODE {
            let (receipt, receipt_source) = match receipt.filter(|r| !r.trim().is_empty()) {
                Some(receipt) => (receipt, ReceiptSource::Provider),
                None => (checkout_request_id.to_string(), ReceiptSource::CheckoutRequest),
            };
            PaymentOutcome::Success {
                receipt,
                receipt_source,
                amount,
                phone_number,
            }
        } else {
            PaymentOutcome::Failure {
                category: ErrorClassifier::classify(result_code).category,
                code: result_code,
                message: result_description.to_string(),
            }
        }
    }
}

/// Fields carried in the callback metadata item list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackMetadata {
    pub receipt_number: Option<String>,
    pub amount: Option<i64>,
    pub phone_number: Option<String>,
    pub transaction_date: Option<String>,
}

/// Inbound result notification, already decoded from the provider's envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackNotification {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub result_code: i32,
    pub result_description: String,
    pub metadata: CallbackMetadata,
}

impl CallbackNotification {
    pub fn to_outcome(&self) -> PaymentOutcome {
        PaymentOutcome::from_result(
            self.result_code,
            &self.result_description,
            self.metadata.receipt_number.clone(),
            self.metadata.amount,
            self.metadata.phone_number.clone(),
            &self.checkout_request_id,
        )
    }

    /// Decode the provider's `{"Body": {"stkCallback": {...}}}` envelope.
    pub fn from_payload(payload: &[u8]) -> Result<Self, PaymentError> {
        let envelope: StkCallbackEnvelope =
            serde_json::from_slice(payload).map_err(|e| PaymentError::Validation {
                message: format!("invalid callback payload: {}", e),
                field: Some("Body.stkCallback".to_string()),
            })?;
        Ok(envelope.body.stk_callback.into())
    }
}

#[derive(Debug, Deserialize)]
struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    body: StkCallbackBody,
}

#[derive(Debug, Deserialize)]
struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    result_code: i32,
    #[serde(rename = "ResultDesc")]
    result_desc: String,
    #[serde(rename = "CallbackMetadata", default)]
    callback_metadata: Option<StkCallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct StkCallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<StkMetadataItem>,
}

#[derive(Debug, Deserialize)]
struct StkMetadataItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value", default)]
    value: Option<JsonValue>,
}

impl From<StkCallback> for CallbackNotification {
    fn from(cb: StkCallback) -> Self {
        let mut metadata = CallbackMetadata::default();
        for item in cb.callback_metadata.map(|m| m.items).unwrap_or_default() {
            let Some(value) = item.value else { continue };
            match item.name.as_str() {
                "MpesaReceiptNumber" => metadata.receipt_number = json_to_string(&value),
                "Amount" => metadata.amount = json_to_amount(&value),
                "PhoneNumber" => metadata.phone_number = json_to_string(&value),
                "TransactionDate" => metadata.transaction_date = json_to_string(&value),
                _ => {}
            }
        }

        CallbackNotification {
            merchant_request_id: cb.merchant_request_id,
            checkout_request_id: cb.checkout_request_id,
            result_code: cb.result_code,
            result_description: cb.result_desc,
            metadata,
        }
    }
}

fn json_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_to_amount(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        JsonValue::String(s) => s.parse::<f64>().ok().map(|f| f.round() as i64),
        _ => None,
    }
}

/// Acknowledgement returned to the provider for every callback delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }
}
