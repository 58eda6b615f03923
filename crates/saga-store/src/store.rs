use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MessageId, SagaId};
use domain::{LedgerKey, ProcessedMessage, SagaState, SagaStatus};

use crate::{Result, StoreError};

/// Options for committing a saga update.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitOptions {
    /// Version the stored saga must be at for the commit to succeed.
    /// If None, no version check is performed.
    pub expected_version: Option<i64>,
}

impl CommitOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the stored saga to be at `version`.
    pub fn expect_version(version: i64) -> Self {
        Self {
            expected_version: Some(version),
        }
    }
}

/// Storage of saga state.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Inserts a new saga and returns its stored version.
    ///
    /// Fails with `DuplicateOrder` if the order already has an active saga.
    async fn insert(&self, saga: &SagaState) -> Result<i64>;

    /// Retrieves a saga by id.
    async fn find_by_id(&self, saga_id: &SagaId) -> Result<Option<SagaState>>;

    /// Retrieves the active saga for an order, if one exists.
    async fn find_active_by_order_id(&self, order_id: i64) -> Result<Option<SagaState>>;

    /// Retrieves every saga ever started for an order, newest first.
    async fn find_by_order_id(&self, order_id: i64) -> Result<Vec<SagaState>>;

    /// Retrieves the sagas started by a user, newest first.
    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<SagaState>>;

    /// Retrieves sagas in any of the given statuses, oldest first.
    async fn find_by_status(&self, statuses: &[SagaStatus]) -> Result<Vec<SagaState>>;

    /// Retrieves active sagas whose current step started at or before `cutoff`.
    async fn find_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<SagaState>>;

    /// Counts sagas per status. Statuses with no sagas are omitted.
    async fn count_by_status(&self) -> Result<HashMap<SagaStatus, u64>>;

    /// Deletes terminal sagas that ended before `cutoff`, with their ledger rows.
    ///
    /// Returns the number of sagas deleted.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// The idempotent-message ledger.
///
/// A message is processed when its message id is recorded, or when a row
/// with the same [`LedgerKey`] exists.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Returns true if the message was already processed.
    async fn is_processed(&self, message_id: Option<&MessageId>, key: &LedgerKey) -> Result<bool>;

    /// Returns the stored result of a processed message.
    async fn processed_result(
        &self,
        message_id: Option<&MessageId>,
        key: &LedgerKey,
    ) -> Result<Option<serde_json::Value>>;

    /// Records a processed message on its own.
    ///
    /// Returns false if an entry with the same id or key already existed;
    /// the existing entry is left unchanged.
    async fn record_processed(&self, record: ProcessedMessage) -> Result<bool>;

    /// Returns true if any message for this step was processed.
    async fn is_step_processed(&self, saga_id: &SagaId, step_id: i32) -> Result<bool>;

    /// Returns the result of the most recent message processed for this step.
    async fn processed_result_for_step(
        &self,
        saga_id: &SagaId,
        step_id: i32,
    ) -> Result<Option<serde_json::Value>>;

    /// Lists the ledger rows of a saga, oldest first.
    async fn processed_messages_for_saga(&self, saga_id: &SagaId) -> Result<Vec<ProcessedMessage>>;

    /// Counts the ledger rows of a saga.
    async fn processed_message_count(&self, saga_id: &SagaId) -> Result<u64>;

    /// Deletes the ledger rows of a saga and returns how many were removed.
    async fn cleanup_saga(&self, saga_id: &SagaId) -> Result<u64>;

    /// Deletes ledger rows processed before `cutoff` and returns how many were removed.
    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// A saga repository and ledger that can be written together.
#[async_trait]
pub trait SagaStore: SagaRepository + IdempotencyLedger {
    /// Writes `saga` and, if given, the ledger row for the message that
    /// produced it, atomically.
    ///
    /// If `options.expected_version` is set and the stored version differs,
    /// nothing is written and `ConcurrencyConflict` is returned. On success
    /// the new stored version is returned. A ledger row whose id or key is
    /// already present is skipped without failing the commit.
    async fn commit(
        &self,
        saga: &SagaState,
        processed: Option<ProcessedMessage>,
        options: CommitOptions,
    ) -> Result<i64>;
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Retrieves a saga, failing with `NotFound` if it does not exist.
    async fn get_required(&self, saga_id: &SagaId) -> Result<SagaState> {
        self.find_by_id(saga_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(saga_id.clone()))
    }

    /// Retrieves every active saga, oldest first.
    async fn find_active(&self) -> Result<Vec<SagaState>> {
        self.find_by_status(&SagaStatus::ACTIVE).await
    }

    /// Commits `saga` against the version it was loaded at and returns it
    /// with the new version applied.
    async fn save(
        &self,
        mut saga: SagaState,
        processed: Option<ProcessedMessage>,
    ) -> Result<SagaState> {
        let version = self
            .commit(&saga, processed, CommitOptions::expect_version(saga.version))
            .await?;
        saga.version = version;
        Ok(saga)
    }
}

// Blanket implementation for all SagaStore implementations
impl<T: SagaStore + ?Sized> SagaStoreExt for T {}
