#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stk_lifecycle::database::memory::InMemoryTransactionStore;
use stk_lifecycle::database::repository::TransactionStore;
use stk_lifecycle::database::transaction::PaymentTransaction;
use stk_lifecycle::payments::providers::sandbox::SUCCESS_NUMBER;
use stk_lifecycle::payments::providers::SandboxGateway;
use stk_lifecycle::payments::types::{CallbackMetadata, CallbackNotification};
use stk_lifecycle::services::notification::EventNotifier;
use stk_lifecycle::services::payment_lifecycle::{
    LifecycleConfig, PaymentLifecycleManager, PaymentRequest,
};
use stk_lifecycle::services::settlement::{SettlementError, SettlementRecord, SettlementRecorder};
use stk_lifecycle::workers::reconciliation::{ReconciliationConfig, ReconciliationWorker};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Keeps every settlement it is handed; can be switched to fail.
#[derive(Default)]
pub struct CountingSettlementRecorder {
    records: Mutex<Vec<SettlementRecord>>,
    fail: AtomicBool,
}

impl CountingSettlementRecorder {
    pub async fn records(&self) -> Vec<SettlementRecord> {
        self.records.lock().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.records.lock().await.len()
    }

    pub fn fail_with_unavailable(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SettlementRecorder for CountingSettlementRecorder {
    async fn record(&self, settlement: &SettlementRecord) -> Result<(), SettlementError> {
        self.records.lock().await.push(settlement.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(SettlementError::Unavailable("ledger offline".to_string()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<InMemoryTransactionStore>,
    pub gateway: Arc<SandboxGateway>,
    pub notifier: Arc<EventNotifier>,
    pub settlement: Arc<CountingSettlementRecorder>,
    pub lifecycle: Arc<PaymentLifecycleManager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(LifecycleConfig::default())
    }

    pub fn with_config(config: LifecycleConfig) -> Self {
        let store = Arc::new(InMemoryTransactionStore::new());
        let gateway = Arc::new(SandboxGateway::new());
        let notifier = Arc::new(EventNotifier::default());
        let settlement = Arc::new(CountingSettlementRecorder::default());
        let lifecycle = Arc::new(PaymentLifecycleManager::new(
            store.clone(),
            gateway.clone(),
            notifier.clone(),
            settlement.clone(),
            config,
        ));
        Self {
            store,
            gateway,
            notifier,
            settlement,
            lifecycle,
        }
    }

    pub fn worker(&self) -> ReconciliationWorker {
        self.worker_with(ReconciliationConfig {
            inter_item_delay: Duration::ZERO,
            ..ReconciliationConfig::default()
        })
    }

    pub fn worker_with(&self, config: ReconciliationConfig) -> ReconciliationWorker {
        let store: Arc<dyn TransactionStore> = self.store.clone();
        ReconciliationWorker::new(store, self.lifecycle.clone(), config)
    }

    pub async fn stored(&self, id: Uuid) -> PaymentTransaction {
        self.store
            .find_by_id(id)
            .await
            .expect("store read")
            .expect("transaction exists")
    }

    /// The callback the sandbox would send for this transaction.
    pub async fn provider_callback(&self, id: Uuid) -> CallbackNotification {
        let tx = self.stored(id).await;
        let ids = tx.correlation_ids().expect("transaction was accepted");
        self.gateway
            .simulate_callback(&ids)
            .await
            .expect("gateway issued this checkout id")
    }
}

pub fn payment_request(order_id: &str) -> PaymentRequest {
    payment_request_to(order_id, SUCCESS_NUMBER)
}

pub fn payment_request_to(order_id: &str, phone: &str) -> PaymentRequest {
    PaymentRequest {
        tenant_id: "tenant-1".to_string(),
        order_id: order_id.to_string(),
        order_reference: Some(format!("INV-{}", order_id)),
        phone_number: phone.to_string(),
        amount: 500,
        description: Some("Subscription".to_string()),
        idempotency_key: None,
    }
}

pub fn callback(tx: &PaymentTransaction, result_code: i32, receipt: Option<&str>) -> CallbackNotification {
    CallbackNotification {
        merchant_request_id: tx.merchant_request_id.clone().unwrap_or_default(),
        checkout_request_id: tx.checkout_request_id.clone().unwrap_or_default(),
        result_code,
        result_description: if result_code == 0 {
            "The service request is processed successfully.".to_string()
        } else {
            format!("failed with {}", result_code)
        },
        metadata: CallbackMetadata {
            receipt_number: receipt.map(str::to_string),
            amount: receipt.map(|_| tx.amount),
            phone_number: Some(tx.phone_number.clone()),
            transaction_date: None,
        },
    }
}
