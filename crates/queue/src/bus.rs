//! Publish/subscribe bus used for lifecycle events and cross-instance signals.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::QueueError;

/// Receiving half of a subscription. Lagging receivers lose the oldest messages.
pub type Subscription = broadcast::Receiver<Value>;

/// Channel-addressed fire-and-forget messaging.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `message` to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, message: Value) -> Result<(), QueueError>;

    /// Start receiving messages published to `channel` from now on.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, QueueError>;
}

const CHANNEL_CAPACITY: usize = 256;

/// In-process [`EventBus`] built on `tokio::sync::broadcast`.
#[derive(Default)]
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Value> {
        self.channels
            .lock()
            .unwrap()
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, channel: &str, message: Value) -> Result<(), QueueError> {
        // No subscribers is not an error.
        let _ = self.sender(channel).send(message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, QueueError> {
        Ok(self.sender(channel).subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_only_see_their_channel() {
        let bus = MemoryBus::new();
        let mut events = bus.subscribe("workflow.event").await.unwrap();
        let mut refresh = bus.subscribe("workflow:schedule:refresh").await.unwrap();

        bus.publish("workflow.event", json!({ "status": "started" })).await.unwrap();

        assert_eq!(events.recv().await.unwrap()["status"], "started");
        assert!(refresh.try_recv().is_err());
    }

    #[tokio::test]
    async fn publishing_without_subscribers_succeeds() {
        let bus = MemoryBus::new();
        assert!(bus.publish("nobody", json!(1)).await.is_ok());
    }
}
