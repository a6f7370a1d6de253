//! Push Broker (C9): delivers title-generation progress to subscribers.
//!
//! Delivery is best-effort and fire-and-forget. A subscriber whose queue
//! fills up is dropped rather than allowed to block the title worker.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::title_service::TitleJobStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitlePushEvent {
    pub conversation_id: Uuid,
    pub status: TitleJobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_delta: Option<String>,
}

type SubscriberId = u64;

struct Subscriber {
    tx: mpsc::Sender<TitlePushEvent>,
}

/// Shared subscriber registry. Cloned cheaply (`Arc` inside) and handed to
/// both the HTTP surface (for new subscriptions) and the title service (as
/// a publish target).
#[derive(Clone)]
pub struct PushBroker {
    inner: Arc<RwLock<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    next_id: SubscriberId,
    subscribers: HashMap<SubscriberId, Subscriber>,
}

impl PushBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(BrokerState::default())),
        }
    }

    /// Register a new subscriber and return its receiver. The subscriber
    /// does not receive events published before it attached (no replay
    /// buffer, per §4.9).
    pub async fn subscribe(&self) -> mpsc::Receiver<TitlePushEvent> {
        let (tx, rx) = mpsc::channel(council_core::limits::SUBSCRIBER_CHANNEL_CAPACITY);
        let mut state = self.inner.write().await;
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, Subscriber { tx });
        rx
    }

    /// Publish to every current subscriber. Subscribers whose channel is
    /// full (lagging) are dropped from the registry entirely.
    pub async fn publish(&self, event: TitlePushEvent) {
        let mut state = self.inner.write().await;
        state.subscribers.retain(|_, sub| sub.tx.try_send(event.clone()).is_ok());
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.read().await.subscribers.len()
    }
}

impl Default for PushBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> TitlePushEvent {
        TitlePushEvent {
            conversation_id: Uuid::new_v4(),
            status: TitleJobStatus::Generating,
            title: None,
            thinking_delta: None,
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let broker = PushBroker::new();
        let mut rx = broker.subscribe().await;
        broker.publish(sample_event()).await;
        let received = rx.recv().await;
        assert!(received.is_some());
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscriber() {
        let broker = PushBroker::new();
        broker.publish(sample_event()).await; // no subscribers yet, dropped
        let mut rx = broker.subscribe().await;
        broker.publish(sample_event()).await;
        let received = rx.try_recv();
        assert!(received.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_dropped() {
        let broker = PushBroker::new();
        let _rx = broker.subscribe().await; // keep receiver alive but never drain
        for _ in 0..(council_core::limits::SUBSCRIBER_CHANNEL_CAPACITY + 10) {
            broker.publish(sample_event()).await;
        }
        assert_eq!(broker.subscriber_count().await, 0);
    }
}
