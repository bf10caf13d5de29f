//! STK-push payment lifecycle: idempotent creation, provider submission,
//! callback and status-query reconciliation, expiry and retries.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod payments;
pub mod services;
pub mod workers;

pub use error::{LifecycleError, LifecycleResult};
