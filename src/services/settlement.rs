//! Hand-off of successful payments to the ledger/billing side.

use crate::logging::mask_phone_number;
use crate::payments::types::ReceiptSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub transaction_id: Uuid,
    pub tenant_id: String,
    pub order_id: String,
    /// Amount requested at creation, not the amount echoed by the provider
    pub amount: i64,
    pub receipt: String,
    /// `CheckoutRequest` when the provider never reported a receipt and the
    /// checkout request id was booked in its place
    pub receipt_source: ReceiptSource,
    pub phone_number: String,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("settlement rejected: {0}")]
    Rejected(String),

    #[error("settlement backend unavailable: {0}")]
    Unavailable(String),
}

/// Books a completed payment. Called at most once per transaction, after the
/// record is durably COMPLETED; failures never revert that state.
#[async_trait]
pub trait SettlementRecorder: Send + Sync {
    async fn record(&self, settlement: &SettlementRecord) -> Result<(), SettlementError>;
}

/// Default recorder for deployments where the ledger consumes the event
/// stream instead.
#[derive(Debug, Default)]
pub struct LoggingSettlementRecorder;

#[async_trait]
impl SettlementRecorder for LoggingSettlementRecorder {
    async fn record(&self, settlement: &SettlementRecord) -> Result<(), SettlementError> {
        info!(
            transaction_id = %settlement.transaction_id,
            tenant_id = %settlement.tenant_id,
            order_id = %settlement.order_id,
            amount = settlement.amount,
            receipt = %settlement.receipt,
            receipt_source = %settlement.receipt_source,
            phone = %mask_phone_number(&settlement.phone_number),
            "🔔 payment settled"
        );
        Ok(())
    }
}
