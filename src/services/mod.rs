//! Services module for the payment lifecycle and its collaborators

pub mod error_classifier;
pub mod notification;
pub mod payment_lifecycle;
pub mod settlement;

pub use error_classifier::{Classification, ErrorClassifier};
pub use notification::{EventNotifier, LifecycleEvent, NotifierError, Subscription};
pub use payment_lifecycle::{
    LifecycleConfig, PaymentInitiation, PaymentLifecycleManager, PaymentRequest,
    RetryEligibility, TransactionStatus,
};
pub use settlement::{
    LoggingSettlementRecorder, SettlementError, SettlementRecord, SettlementRecorder,
};
