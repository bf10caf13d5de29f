pub mod error;
pub mod provider;
pub mod providers;
pub mod token_cache;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult};
pub use provider::PaymentGateway;
pub use token_cache::AccessTokenCache;
pub use types::{
    CallbackAck, CallbackNotification, CorrelationIds, ErrorCategory, PaymentOutcome,
    ProviderName, SubmitRequest, SubmitResponse,
};
