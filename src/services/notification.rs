//! Lifecycle event fan-out.
//!
//! One broadcast channel per event name plus a `*` channel that sees every
//! event. Delivery is best effort: a subscriber that falls more than the
//! channel capacity behind loses the oldest events and must re-read the
//! transaction from the store.

use crate::database::transaction::{PaymentTransaction, TransactionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

pub const WILDCARD: &str = "*";
pub const PAYMENT_CREATED: &str = "payment.created";
pub const PAYMENT_AWAITING_CONFIRMATION: &str = "payment.awaiting_confirmation";
pub const PAYMENT_COMPLETED: &str = "payment.completed";
pub const PAYMENT_FAILED: &str = "payment.failed";
pub const PAYMENT_EXPIRED: &str = "payment.expired";

const EVENT_NAMES: [&str; 6] = [
    WILDCARD,
    PAYMENT_CREATED,
    PAYMENT_AWAITING_CONFIRMATION,
    PAYMENT_COMPLETED,
    PAYMENT_FAILED,
    PAYMENT_EXPIRED,
];

const DEFAULT_CAPACITY: usize = 256;

pub fn event_name_for(state: TransactionState) -> &'static str {
    match state {
        TransactionState::Created => PAYMENT_CREATED,
        TransactionState::AwaitingConfirmation => PAYMENT_AWAITING_CONFIRMATION,
        TransactionState::Completed => PAYMENT_COMPLETED,
        TransactionState::Failed => PAYMENT_FAILED,
        TransactionState::Expired => PAYMENT_EXPIRED,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub transaction_id: Uuid,
    pub state: TransactionState,
    pub previous_state: Option<TransactionState>,
    pub details: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn from_transaction(tx: &PaymentTransaction, details: JsonValue) -> Self {
        Self {
            transaction_id: tx.id,
            state: tx.state,
            previous_state: tx.previous_state,
            details,
            occurred_at: tx.updated_at,
        }
    }

    pub fn event_name(&self) -> &'static str {
        event_name_for(self.state)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NotifierError {
    #[error("unknown event name '{0}'")]
    UnknownEvent(String),
}

pub struct Subscription {
    pub id: Uuid,
    pub event_name: &'static str,
    receiver: broadcast::Receiver<LifecycleEvent>,
}

impl Subscription {
    /// Next event, skipping over any this subscriber was too slow to receive.
    /// `None` once the notifier is dropped.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        subscription_id = %self.id,
                        event_name = self.event_name,
                        missed,
                        "subscriber lagged; events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

pub struct EventNotifier {
    channels: HashMap<&'static str, broadcast::Sender<LifecycleEvent>>,
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventNotifier {
    pub fn new(capacity: usize) -> Self {
        let channels = EVENT_NAMES
            .iter()
            .map(|name| (*name, broadcast::channel(capacity.max(1)).0))
            .collect();
        Self { channels }
    }

    pub fn subscribe(&self, event_name: &str) -> Result<Subscription, NotifierError> {
        let (name, sender) = self
            .channels
            .get_key_value(event_name)
            .ok_or_else(|| NotifierError::UnknownEvent(event_name.to_string()))?;

        let subscription = Subscription {
            id: Uuid::new_v4(),
            event_name: *name,
            receiver: sender.subscribe(),
        };
        debug!(subscription_id = %subscription.id, event_name = *name, "subscribed");
        Ok(subscription)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        debug!(
            subscription_id = %subscription.id,
            event_name = subscription.event_name,
            "unsubscribed"
        );
        drop(subscription);
    }

    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.channels
            .get(event_name)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Deliver to the event's own channel and the wildcard channel. Returns the
    /// number of receivers reached; zero subscribers is not an error.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        let mut delivered = 0;
        for name in [event.event_name(), WILDCARD] {
            if let Some(sender) = self.channels.get(name) {
                if let Ok(count) = sender.send(event.clone()) {
                    delivered += count;
                }
            }
        }
        debug!(
            transaction_id = %event.transaction_id,
            state = %event.state,
            delivered,
            "lifecycle event published"
        );
        delivered
    }
}
