use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MessageId, SagaId};
use domain::{LedgerKey, ProcessedMessage, SagaState, SagaStatus};
use tokio::sync::RwLock;

use crate::{
    Result, StoreError,
    store::{CommitOptions, IdempotencyLedger, SagaRepository, SagaStore},
};

#[derive(Default)]
struct MemoryState {
    sagas: HashMap<SagaId, SagaState>,
    processed: HashMap<MessageId, ProcessedMessage>,
    keys: HashMap<LedgerKey, MessageId>,
}

impl MemoryState {
    fn lookup(&self, message_id: Option<&MessageId>, key: &LedgerKey) -> Option<&ProcessedMessage> {
        message_id
            .and_then(|id| self.processed.get(id))
            .or_else(|| self.keys.get(key).and_then(|id| self.processed.get(id)))
    }

    fn insert_processed(&mut self, record: ProcessedMessage) -> bool {
        let key = record.key();
        if self.processed.contains_key(&record.message_id) || self.keys.contains_key(&key) {
            return false;
        }
        self.keys.insert(key, record.message_id.clone());
        self.processed.insert(record.message_id.clone(), record);
        true
    }

    fn remove_processed_where(&mut self, predicate: impl Fn(&ProcessedMessage) -> bool) -> u64 {
        let doomed: Vec<MessageId> = self
            .processed
            .values()
            .filter(|record| predicate(record))
            .map(|record| record.message_id.clone())
            .collect();
        for id in &doomed {
            if let Some(record) = self.processed.remove(id) {
                self.keys.remove(&record.key());
            }
        }
        doomed.len() as u64
    }

    fn step_records(
        &self,
        saga_id: &SagaId,
        step_id: i32,
    ) -> impl Iterator<Item = &ProcessedMessage> {
        self.processed
            .values()
            .filter(move |record| &record.saga_id == saga_id && record.step_id == step_id)
    }
}

/// In-memory saga store for testing and single-process use.
///
/// Sagas and ledger rows live behind a single lock, so `commit` is atomic
/// in the same way a database transaction is.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemorySagaStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.state.read().await.sagas.len()
    }

    /// Returns the number of ledger rows across all sagas.
    pub async fn ledger_len(&self) -> usize {
        self.state.read().await.processed.len()
    }

    /// Clears all sagas and ledger rows.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.sagas.clear();
        state.processed.clear();
        state.keys.clear();
    }
}

fn newest_first(mut sagas: Vec<SagaState>) -> Vec<SagaState> {
    sagas.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    sagas
}

#[async_trait]
impl SagaRepository for InMemorySagaStore {
    async fn insert(&self, saga: &SagaState) -> Result<i64> {
        let mut state = self.state.write().await;

        let order_busy = state
            .sagas
            .values()
            .any(|existing| existing.order_id == saga.order_id && existing.is_active());
        if order_busy {
            return Err(StoreError::DuplicateOrder {
                order_id: saga.order_id,
            });
        }
        if let Some(existing) = state.sagas.get(&saga.saga_id) {
            return Err(StoreError::ConcurrencyConflict {
                saga_id: saga.saga_id.clone(),
                expected: 0,
                actual: existing.version,
            });
        }

        let mut stored = saga.clone();
        stored.version = 1;
        state.sagas.insert(stored.saga_id.clone(), stored);
        Ok(1)
    }

    async fn find_by_id(&self, saga_id: &SagaId) -> Result<Option<SagaState>> {
        Ok(self.state.read().await.sagas.get(saga_id).cloned())
    }

    async fn find_active_by_order_id(&self, order_id: i64) -> Result<Option<SagaState>> {
        let state = self.state.read().await;
        Ok(state
            .sagas
            .values()
            .find(|saga| saga.order_id == order_id && saga.is_active())
            .cloned())
    }

    async fn find_by_order_id(&self, order_id: i64) -> Result<Vec<SagaState>> {
        let state = self.state.read().await;
        let sagas = state
            .sagas
            .values()
            .filter(|saga| saga.order_id == order_id)
            .cloned()
            .collect();
        Ok(newest_first(sagas))
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<SagaState>> {
        let state = self.state.read().await;
        let sagas = state
            .sagas
            .values()
            .filter(|saga| saga.user_id == user_id)
            .cloned()
            .collect();
        Ok(newest_first(sagas))
    }

    async fn find_by_status(&self, statuses: &[SagaStatus]) -> Result<Vec<SagaState>> {
        let state = self.state.read().await;
        let mut sagas: Vec<SagaState> = state
            .sagas
            .values()
            .filter(|saga| statuses.contains(&saga.status))
            .cloned()
            .collect();
        sagas.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(sagas)
    }

    async fn find_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<SagaState>> {
        let state = self.state.read().await;
        let mut sagas: Vec<SagaState> = state
            .sagas
            .values()
            .filter(|saga| saga.is_active() && saga.step_started_before(cutoff))
            .cloned()
            .collect();
        sagas.sort_by(|a, b| a.current_step_start_time.cmp(&b.current_step_start_time));
        Ok(sagas)
    }

    async fn count_by_status(&self) -> Result<HashMap<SagaStatus, u64>> {
        let state = self.state.read().await;
        let mut counts = HashMap::new();
        for saga in state.sagas.values() {
            *counts.entry(saga.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let doomed: Vec<SagaId> = state
            .sagas
            .values()
            .filter(|saga| saga.is_terminal() && saga.end_time.is_some_and(|end| end < cutoff))
            .map(|saga| saga.saga_id.clone())
            .collect();

        for saga_id in &doomed {
            state.sagas.remove(saga_id);
            state.remove_processed_where(|record| &record.saga_id == saga_id);
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl IdempotencyLedger for InMemorySagaStore {
    async fn is_processed(&self, message_id: Option<&MessageId>, key: &LedgerKey) -> Result<bool> {
        Ok(self.state.read().await.lookup(message_id, key).is_some())
    }

    async fn processed_result(
        &self,
        message_id: Option<&MessageId>,
        key: &LedgerKey,
    ) -> Result<Option<serde_json::Value>> {
        let state = self.state.read().await;
        Ok(state.lookup(message_id, key).map(|record| record.result.clone()))
    }

    async fn record_processed(&self, record: ProcessedMessage) -> Result<bool> {
        Ok(self.state.write().await.insert_processed(record))
    }

    async fn is_step_processed(&self, saga_id: &SagaId, step_id: i32) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.step_records(saga_id, step_id).next().is_some())
    }

    async fn processed_result_for_step(
        &self,
        saga_id: &SagaId,
        step_id: i32,
    ) -> Result<Option<serde_json::Value>> {
        let state = self.state.read().await;
        Ok(state
            .step_records(saga_id, step_id)
            .max_by_key(|record| record.processed_at)
            .map(|record| record.result.clone()))
    }

    async fn processed_messages_for_saga(&self, saga_id: &SagaId) -> Result<Vec<ProcessedMessage>> {
        let state = self.state.read().await;
        let mut records: Vec<ProcessedMessage> = state
            .processed
            .values()
            .filter(|record| &record.saga_id == saga_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.processed_at.cmp(&b.processed_at));
        Ok(records)
    }

    async fn processed_message_count(&self, saga_id: &SagaId) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .processed
            .values()
            .filter(|record| &record.saga_id == saga_id)
            .count() as u64)
    }

    async fn cleanup_saga(&self, saga_id: &SagaId) -> Result<u64> {
        let mut state = self.state.write().await;
        Ok(state.remove_processed_where(|record| &record.saga_id == saga_id))
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        Ok(state.remove_processed_where(|record| record.processed_at < cutoff))
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn commit(
        &self,
        saga: &SagaState,
        processed: Option<ProcessedMessage>,
        options: CommitOptions,
    ) -> Result<i64> {
        let mut state = self.state.write().await;

        let current = state
            .sagas
            .get(&saga.saga_id)
            .map(|stored| stored.version)
            .ok_or_else(|| StoreError::NotFound(saga.saga_id.clone()))?;

        if let Some(expected) = options.expected_version
            && current != expected
        {
            return Err(StoreError::ConcurrencyConflict {
                saga_id: saga.saga_id.clone(),
                expected,
                actual: current,
            });
        }

        let mut stored = saga.clone();
        stored.version = current + 1;
        state.sagas.insert(stored.saga_id.clone(), stored);

        if let Some(record) = processed {
            state.insert_processed(record);
        }
        Ok(current + 1)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use common::Money;
    use domain::{NewSaga, RetryLimits};

    use super::*;
    use crate::store::SagaStoreExt;

    fn new_saga(order_id: i64) -> SagaState {
        SagaState::initiate(
            SagaId::generate(),
            NewSaga {
                order_id,
                user_id: "user-1".to_string(),
                user_email: "user@example.com".to_string(),
                user_name: "User".to_string(),
                description: "order".to_string(),
                total_amount: Money::from_cents(12000),
            },
            RetryLimits::default(),
        )
    }

    fn ledger_row(saga: &SagaState, message_id: Option<&str>, message_type: &str) -> ProcessedMessage {
        ProcessedMessage::new(
            message_id.map(MessageId::new),
            LedgerKey::new(saga.saga_id.clone(), 1, message_type, 0),
            serde_json::json!({"status": "ok"}),
        )
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(500);

        assert_eq!(store.insert(&saga).await.unwrap(), 1);

        let loaded = store.get_required(&saga.saga_id).await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.order_id, 500);
        assert_eq!(
            store.find_active_by_order_id(500).await.unwrap().unwrap().saga_id,
            saga.saga_id
        );
        assert_eq!(store.find_by_user_id("user-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_one_active_saga_per_order() {
        let store = InMemorySagaStore::new();
        store.insert(&new_saga(500)).await.unwrap();

        let result = store.insert(&new_saga(500)).await;
        assert!(matches!(result, Err(StoreError::DuplicateOrder { order_id: 500 })));

        store.insert(&new_saga(501)).await.unwrap();
        assert_eq!(store.saga_count().await, 2);
    }

    #[tokio::test]
    async fn test_finished_saga_frees_its_order() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(500);
        store.insert(&saga).await.unwrap();

        let mut saga = store.get_required(&saga.saga_id).await.unwrap();
        saga.fail("declined").unwrap();
        saga.begin_compensation().unwrap();
        saga.complete_compensation_step().unwrap();
        store.save(saga, None).await.unwrap();

        store.insert(&new_saga(500)).await.unwrap();
        assert_eq!(store.find_by_order_id(500).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_checks_version() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(500);
        store.insert(&saga).await.unwrap();

        let first = store.get_required(&saga.saga_id).await.unwrap();
        let second = first.clone();

        let saved = store.save(first, None).await.unwrap();
        assert_eq!(saved.version, 2);

        let result = store.save(second, None).await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { expected: 1, actual: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_commit_unknown_saga_is_not_found() {
        let store = InMemorySagaStore::new();
        let result = store.commit(&new_saga(1), None, CommitOptions::new()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_commit_writes_no_ledger_row() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(500);
        store.insert(&saga).await.unwrap();

        let row = ledger_row(&saga, Some("MSG-1"), "PAYMENT_PROCESSED");
        let result = store
            .commit(&saga, Some(row), CommitOptions::expect_version(7))
            .await;
        assert!(result.is_err());
        assert_eq!(store.processed_message_count(&saga.saga_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ledger_matches_by_id_or_key() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(500);
        let row = ledger_row(&saga, Some("MSG-1"), "PAYMENT_PROCESSED");
        let key = row.key();
        assert!(store.record_processed(row).await.unwrap());

        let by_id = LedgerKey::new(saga.saga_id.clone(), 9, "OTHER", 0);
        assert!(
            store
                .is_processed(Some(&MessageId::new("MSG-1")), &by_id)
                .await
                .unwrap()
        );
        assert!(
            store
                .is_processed(Some(&MessageId::new("MSG-2")), &key)
                .await
                .unwrap()
        );
        assert!(!store.is_processed(None, &by_id).await.unwrap());

        let result = store.processed_result(None, &key).await.unwrap().unwrap();
        assert_eq!(result["status"], "ok");
    }

    #[tokio::test]
    async fn test_duplicate_record_is_rejected() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(500);
        assert!(
            store
                .record_processed(ledger_row(&saga, Some("MSG-1"), "PAYMENT_PROCESSED"))
                .await
                .unwrap()
        );
        assert!(
            !store
                .record_processed(ledger_row(&saga, Some("MSG-2"), "PAYMENT_PROCESSED"))
                .await
                .unwrap()
        );
        assert_eq!(store.processed_message_count(&saga.saga_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_step_queries() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(500);
        store
            .record_processed(ledger_row(&saga, None, "PAYMENT_PROCESSED"))
            .await
            .unwrap();

        assert!(store.is_step_processed(&saga.saga_id, 1).await.unwrap());
        assert!(!store.is_step_processed(&saga.saga_id, 2).await.unwrap());
        let result = store
            .processed_result_for_step(&saga.saga_id, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["status"], "ok");
        assert_eq!(
            store.processed_messages_for_saga(&saga.saga_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_eviction_and_cleanup() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(500);
        let mut old = ledger_row(&saga, Some("MSG-old"), "PAYMENT_PROCESSED");
        old.processed_at = Utc::now() - Duration::days(40);
        store.record_processed(old).await.unwrap();
        store
            .record_processed(ledger_row(&saga, Some("MSG-new"), "ORDER_CANCELLED"))
            .await
            .unwrap();

        let evicted = store
            .evict_older_than(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(store.cleanup_saga(&saga.saga_id).await.unwrap(), 1);
        assert_eq!(store.ledger_len().await, 0);
    }

    #[tokio::test]
    async fn test_find_stuck_and_purge() {
        let store = InMemorySagaStore::new();
        let mut stuck = new_saga(500);
        stuck.current_step_start_time = Utc::now() - Duration::minutes(20);
        store.insert(&stuck).await.unwrap();
        store.insert(&new_saga(501)).await.unwrap();

        let found = store
            .find_stuck(Utc::now() - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].order_id, 500);

        let mut done = store.get_required(&stuck.saga_id).await.unwrap();
        done.fail("timeout").unwrap();
        done.begin_compensation().unwrap();
        done.complete_compensation_step().unwrap();
        done.end_time = Some(Utc::now() - Duration::days(31));
        store.save(done, None).await.unwrap();

        let purged = store
            .purge_terminal_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.saga_count().await, 1);

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&SagaStatus::Started), Some(&1));
    }
}
