//! Change notification brokers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::Result;

/// A change published to interested observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: String,
    pub event: String,
    pub payload: serde_json::Value,
}

/// Sink for change notifications (live dashboards, message buses, ...).
#[async_trait]
pub trait ChangeBroker: Send + Sync {
    async fn publish(&self, topic: &str, event: &str, payload: serde_json::Value) -> Result<()>;
}

/// In-process broker fanning changes out to any number of subscribers.
///
/// Publishing with no subscribers is not an error; slow subscribers lose
/// the oldest events once `capacity` is exceeded.
#[derive(Clone)]
pub struct BroadcastBroker {
    tx: broadcast::Sender<ChangeEvent>,
}

impl BroadcastBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ChangeBroker for BroadcastBroker {
    async fn publish(&self, topic: &str, event: &str, payload: serde_json::Value) -> Result<()> {
        let _ = self.tx.send(ChangeEvent {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        });
        Ok(())
    }
}
