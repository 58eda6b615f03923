//! Key-ordered delivery of inbound messages.
//!
//! Every envelope is routed to one of N workers by hashing its `sagaId`.
//! Each worker owns a single mpsc receiver and awaits its handler one
//! message at a time, so two messages for the same saga are never handled
//! concurrently while different sagas proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Result, SagaError};
use crate::messaging::MessageEnvelope;

/// Default number of envelopes buffered per partition.
pub const DEFAULT_PARTITION_CAPACITY: usize = 1024;

/// Consumer of inbound envelopes.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one envelope that arrived on `topic`.
    async fn handle(&self, topic: &str, envelope: MessageEnvelope) -> Result<()>;
}

#[derive(Debug)]
struct Delivery {
    topic: String,
    envelope: MessageEnvelope,
}

/// Returns the partition `key` is routed to.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

/// Routes envelopes onto per-partition workers.
pub struct PartitionedDispatcher {
    senders: RwLock<Vec<mpsc::Sender<Delivery>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    partitions: usize,
}

impl PartitionedDispatcher {
    /// Spawns `partitions` workers feeding `handler`.
    pub fn start<H>(handler: Arc<H>, partitions: usize, capacity: usize) -> Self
    where
        H: MessageHandler + 'static,
    {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);

        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(partition, handler.clone(), rx)));
        }

        tracing::info!(partitions, "message dispatcher started");

        Self {
            senders: RwLock::new(senders),
            workers: Mutex::new(workers),
            partitions,
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Queues `envelope` on the partition of its saga.
    ///
    /// Waits for room when the partition is full.
    pub async fn dispatch(&self, topic: impl Into<String>, envelope: MessageEnvelope) -> Result<()> {
        let key = envelope
            .saga_id
            .as_ref()
            .map(|id| id.as_str())
            .unwrap_or_default();
        let partition = partition_for(key, self.partitions);

        let senders = self.senders.read().await;
        let sender = senders.get(partition).ok_or(SagaError::DispatcherClosed)?;
        sender
            .send(Delivery {
                topic: topic.into(),
                envelope,
            })
            .await
            .map_err(|_| SagaError::DispatcherClosed)
    }

    /// Stops accepting envelopes and waits for queued ones to be handled.
    pub async fn shutdown(&self) {
        let senders = std::mem::take(&mut *self.senders.write().await);
        drop(senders);

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "dispatcher worker panicked");
            }
        }
        tracing::info!("message dispatcher stopped");
    }
}

async fn run_worker<H>(partition: usize, handler: Arc<H>, mut rx: mpsc::Receiver<Delivery>)
where
    H: MessageHandler + 'static,
{
    while let Some(Delivery { topic, envelope }) = rx.recv().await {
        let message_type = envelope.message_type.clone();
        if let Err(e) = handler.handle(&topic, envelope).await {
            tracing::warn!(
                partition,
                topic = %topic,
                message_type = %message_type,
                error = %e,
                "message handling failed"
            );
        }
    }
    tracing::debug!(partition, "dispatcher worker drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SagaId;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, _topic: &str, envelope: MessageEnvelope) -> Result<()> {
            let saga = envelope.saga_id.map(|id| id.to_string()).unwrap_or_default();
            tokio::task::yield_now().await;
            self.seen.lock().await.push((saga, envelope.message_type));
            Ok(())
        }
    }

    #[test]
    fn test_partition_is_stable_and_in_range() {
        for key in ["a", "b", "ORDER_PURCHASE-1-x", ""] {
            let p = partition_for(key, 8);
            assert!(p < 8);
            assert_eq!(p, partition_for(key, 8));
        }
        assert_eq!(partition_for("anything", 1), 0);
    }

    #[tokio::test]
    async fn test_per_saga_order_is_preserved() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = PartitionedDispatcher::start(handler.clone(), 4, 16);

        for i in 0..20 {
            for saga in ["saga-a", "saga-b", "saga-c"] {
                let envelope = MessageEnvelope::new(format!("E{i}"), serde_json::Value::Null)
                    .with_saga(SagaId::new(saga));
                dispatcher.dispatch("order-events", envelope).await.unwrap();
            }
        }
        dispatcher.shutdown().await;

        let seen = handler.seen.lock().await;
        assert_eq!(seen.len(), 60);
        for saga in ["saga-a", "saga-b", "saga-c"] {
            let order: Vec<&str> = seen
                .iter()
                .filter(|(s, _)| s == saga)
                .map(|(_, t)| t.as_str())
                .collect();
            let expected: Vec<String> = (0..20).map(|i| format!("E{i}")).collect();
            assert_eq!(order, expected.iter().map(String::as_str).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_rejected() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = PartitionedDispatcher::start(handler, 2, 4);
        dispatcher.shutdown().await;

        let result = dispatcher
            .dispatch("order-events", MessageEnvelope::new("X", serde_json::Value::Null))
            .await;
        assert!(matches!(result, Err(SagaError::DispatcherClosed)));
    }
}
