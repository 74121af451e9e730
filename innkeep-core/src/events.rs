use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CoreResult;

/// An event staged for publication. Written to the outbox in the same
/// transaction as the state change it describes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxMessage {
    pub topic: String,
    pub key: String,
    pub payload: String,
}

impl OutboxMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: i64,
    pub message: OutboxMessage,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a payload to the broker, returning once it is acknowledged
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> CoreResult<()>;
}
