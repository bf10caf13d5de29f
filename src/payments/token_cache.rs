//! Owned, expiring cache for provider OAuth access tokens.
//!
//! A gateway holds one of these behind an `Arc`; tokens are refreshed lazily
//! when the cached one is missing or within `refresh_margin` of expiry.

use crate::payments::error::PaymentResult;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

pub struct AccessTokenCache {
    token: RwLock<Option<AccessToken>>,
    refresh_margin: ChronoDuration,
}

impl AccessTokenCache {
    pub fn new(refresh_margin: std::time::Duration) -> Self {
        Self {
            token: RwLock::new(None),
            refresh_margin: ChronoDuration::from_std(refresh_margin)
                .unwrap_or_else(|_| ChronoDuration::minutes(5)),
        }
    }

    /// Cached token if it is still comfortably valid at `now`.
    pub async fn current(&self, now: DateTime<Utc>) -> Option<String> {
        let guard = self.token.read().await;
        guard
            .as_ref()
            .filter(|t| t.expires_at > now + self.refresh_margin)
            .map(|t| t.value.clone())
    }

    /// Return the cached token or run `fetch` to obtain a new one. Concurrent
    /// callers that miss the cache serialize on the write lock so only one
    /// refresh request reaches the provider.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> PaymentResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PaymentResult<AccessToken>>,
    {
        let now = Utc::now();
        if let Some(token) = self.current(now).await {
            debug!("using cached provider access token");
            return Ok(token);
        }

        let mut guard = self.token.write().await;
        if let Some(token) = guard
            .as_ref()
            .filter(|t| t.expires_at > Utc::now() + self.refresh_margin)
        {
            return Ok(token.value.clone());
        }

        let fresh = fetch().await?;
        info!(expires_at = %fresh.expires_at, "provider access token refreshed");
        let value = fresh.value.clone();
        *guard = Some(fresh);
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.token.write().await = None;
    }
}
