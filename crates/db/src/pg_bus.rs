//! Postgres `LISTEN/NOTIFY` implementation of [`queue::EventBus`].
//!
//! Lets several engine processes share lifecycle events and
//! workflow-changed signals without another broker.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use queue::{EventBus, QueueError, Subscription};
use serde_json::Value;
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::DbPool;

const CHANNEL_CAPACITY: usize = 256;

pub struct PgEventBus {
    pool: DbPool,
    /// One listener task per channel fans out into these senders.
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl PgEventBus {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            channels: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EventBus for PgEventBus {
    async fn publish(&self, channel: &str, message: Value) -> Result<(), QueueError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(message.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, QueueError> {
        let existing = self.channels.lock().unwrap().get(channel).cloned();
        if let Some(tx) = existing {
            return Ok(tx.subscribe());
        }

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        listener
            .listen(channel)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let (tx, rx) = {
            let mut channels = self.channels.lock().unwrap();
            // Another subscriber may have raced us; reuse its listener.
            if let Some(tx) = channels.get(channel) {
                return Ok(tx.subscribe());
            }
            let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
            channels.insert(channel.to_owned(), tx.clone());
            (tx, rx)
        };

        let channel = channel.to_owned();
        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => match serde_json::from_str::<Value>(notification.payload()) {
                        Ok(message) => {
                            let _ = tx.send(message);
                        }
                        Err(e) => warn!(%channel, error = %e, "ignoring non-JSON notification"),
                    },
                    Err(e) => {
                        // PgListener reconnects on the next recv.
                        error!(%channel, error = %e, "notification listener error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(rx)
    }
}
