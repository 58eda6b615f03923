//! Outbound message publishing and an in-memory bus.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Result, SagaError};
use crate::messaging::MessageEnvelope;

/// Trait for publishing envelopes to a partitioned message bus.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes `envelope` to `topic` using `key` as the partition key.
    async fn publish(&self, topic: &str, key: &str, envelope: &MessageEnvelope) -> Result<()>;
}

/// A message accepted by the in-memory bus.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub envelope: MessageEnvelope,
}

#[derive(Debug, Default)]
struct InMemoryBusState {
    published: Vec<PublishedMessage>,
    fail_on_publish: bool,
}

/// In-memory message bus for testing and single-process use.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    state: Arc<RwLock<InMemoryBusState>>,
}

impl InMemoryBus {
    /// Creates a new empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the bus to refuse every publish.
    pub async fn set_fail_on_publish(&self, fail: bool) {
        self.state.write().await.fail_on_publish = fail;
    }

    /// Returns every accepted message in publish order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.read().await.published.clone()
    }

    /// Returns the accepted messages for `topic` in publish order.
    pub async fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state
            .read()
            .await
            .published
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    /// Returns the most recent accepted message, if any.
    pub async fn last(&self) -> Option<PublishedMessage> {
        self.state.read().await.published.last().cloned()
    }

    /// Returns the number of accepted messages.
    pub async fn len(&self) -> usize {
        self.state.read().await.published.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every recorded message.
    pub async fn clear(&self) {
        self.state.write().await.published.clear();
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBus {
    async fn publish(&self, topic: &str, key: &str, envelope: &MessageEnvelope) -> Result<()> {
        let mut state = self.state.write().await;

        if state.fail_on_publish {
            return Err(SagaError::Publish {
                topic: topic.to_string(),
                reason: "bus unavailable".to_string(),
            });
        }

        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            envelope: envelope.clone(),
        });
        Ok(())
    }
}
