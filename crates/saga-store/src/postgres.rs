use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MessageId, Money, SagaId};
use domain::{ActionType, LedgerKey, ProcessedMessage, SagaState, SagaStatus, SagaStep};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::{
    Result, StoreError,
    store::{CommitOptions, IdempotencyLedger, SagaRepository, SagaStore},
};

const SAGA_COLUMNS: &str = "saga_id, order_id, user_id, user_email, user_name, description, \
     total_amount_cents, current_step, status, completed_steps, events, start_time, \
     current_step_start_time, last_updated_time, end_time, retry_count, max_retries, \
     compensation_retry_count, max_compensation_retries, failure_reason, \
     payment_transaction_id, version";

const LEDGER_COLUMNS: &str =
    "message_id, saga_id, step_id, action_type, message_type, attempt, result, processed_at";

const ACTIVE_ORDER_INDEX: &str = "unique_active_saga_per_order";

/// PostgreSQL-backed saga store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_saga(row: PgRow) -> Result<SagaState> {
        let current_step: String = row.try_get("current_step")?;
        let status: String = row.try_get("status")?;
        let completed_steps: serde_json::Value = row.try_get("completed_steps")?;
        let events: serde_json::Value = row.try_get("events")?;

        Ok(SagaState {
            saga_id: SagaId::new(row.try_get::<String, _>("saga_id")?),
            order_id: row.try_get("order_id")?,
            user_id: row.try_get("user_id")?,
            user_email: row.try_get("user_email")?,
            user_name: row.try_get("user_name")?,
            description: row.try_get("description")?,
            total_amount: Money::from_cents(row.try_get("total_amount_cents")?),
            current_step: current_step.parse::<SagaStep>()?,
            status: status.parse::<SagaStatus>()?,
            completed_steps: serde_json::from_value(completed_steps)?,
            events: serde_json::from_value(events)?,
            start_time: row.try_get("start_time")?,
            current_step_start_time: row.try_get("current_step_start_time")?,
            last_updated_time: row.try_get("last_updated_time")?,
            end_time: row.try_get("end_time")?,
            retry_count: row.try_get::<i32, _>("retry_count")? as u32,
            max_retries: row.try_get::<i32, _>("max_retries")? as u32,
            compensation_retry_count: row.try_get::<i32, _>("compensation_retry_count")? as u32,
            max_compensation_retries: row.try_get::<i32, _>("max_compensation_retries")? as u32,
            failure_reason: row.try_get("failure_reason")?,
            payment_transaction_id: row.try_get("payment_transaction_id")?,
            version: row.try_get("version")?,
        })
    }

    fn row_to_processed(row: PgRow) -> Result<ProcessedMessage> {
        let action_type: String = row.try_get("action_type")?;
        Ok(ProcessedMessage {
            message_id: MessageId::new(row.try_get::<String, _>("message_id")?),
            saga_id: SagaId::new(row.try_get::<String, _>("saga_id")?),
            step_id: row.try_get("step_id")?,
            action_type: action_type.parse::<ActionType>()?,
            message_type: row.try_get("message_type")?,
            attempt: row.try_get("attempt")?,
            result: row.try_get("result")?,
            processed_at: row.try_get("processed_at")?,
        })
    }

    async fn insert_processed(
        tx: &mut Transaction<'_, Postgres>,
        record: &ProcessedMessage,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO processed_messages (message_id, saga_id, step_id, action_type, message_type, attempt, result, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.message_id.as_str())
        .bind(record.saga_id.as_str())
        .bind(record.step_id)
        .bind(record.action_type.as_str())
        .bind(&record.message_type)
        .bind(record.attempt)
        .bind(&record.result)
        .bind(record.processed_at)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }
}

fn status_names(statuses: &[SagaStatus]) -> Vec<String> {
    statuses.iter().map(|status| status.as_str().to_string()).collect()
}

#[async_trait]
impl SagaRepository for PostgresSagaStore {
    async fn insert(&self, saga: &SagaState) -> Result<i64> {
        let completed_steps = serde_json::to_value(&saga.completed_steps)?;
        let events = serde_json::to_value(&saga.events)?;

        sqlx::query(&format!(
            "INSERT INTO sagas ({SAGA_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, 1)"
        ))
        .bind(saga.saga_id.as_str())
        .bind(saga.order_id)
        .bind(&saga.user_id)
        .bind(&saga.user_email)
        .bind(&saga.user_name)
        .bind(&saga.description)
        .bind(saga.total_amount.cents())
        .bind(saga.current_step.as_str())
        .bind(saga.status.as_str())
        .bind(completed_steps)
        .bind(events)
        .bind(saga.start_time)
        .bind(saga.current_step_start_time)
        .bind(saga.last_updated_time)
        .bind(saga.end_time)
        .bind(saga.retry_count as i32)
        .bind(saga.max_retries as i32)
        .bind(saga.compensation_retry_count as i32)
        .bind(saga.max_compensation_retries as i32)
        .bind(&saga.failure_reason)
        .bind(&saga.payment_transaction_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.constraint() == Some(ACTIVE_ORDER_INDEX) {
                    return StoreError::DuplicateOrder {
                        order_id: saga.order_id,
                    };
                }
                if db_err.constraint() == Some("sagas_pkey") {
                    return StoreError::ConcurrencyConflict {
                        saga_id: saga.saga_id.clone(),
                        expected: 0,
                        actual: 1,
                    };
                }
            }
            StoreError::Database(e)
        })?;

        Ok(1)
    }

    async fn find_by_id(&self, saga_id: &SagaId) -> Result<Option<SagaState>> {
        let row: Option<PgRow> =
            sqlx::query(&format!("SELECT {SAGA_COLUMNS} FROM sagas WHERE saga_id = $1"))
                .bind(saga_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn find_active_by_order_id(&self, order_id: i64) -> Result<Option<SagaState>> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM sagas WHERE order_id = $1 AND status = ANY($2) LIMIT 1"
        ))
        .bind(order_id)
        .bind(status_names(&SagaStatus::ACTIVE))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn find_by_order_id(&self, order_id: i64) -> Result<Vec<SagaState>> {
        let rows = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM sagas WHERE order_id = $1 ORDER BY start_time DESC"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<SagaState>> {
        let rows = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM sagas WHERE user_id = $1 ORDER BY start_time DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn find_by_status(&self, statuses: &[SagaStatus]) -> Result<Vec<SagaState>> {
        let rows = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM sagas WHERE status = ANY($1) ORDER BY start_time ASC"
        ))
        .bind(status_names(statuses))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn find_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<SagaState>> {
        let rows = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM sagas \
             WHERE status = ANY($1) AND current_step_start_time <= $2 \
             ORDER BY current_step_start_time ASC"
        ))
        .bind(status_names(&SagaStatus::ACTIVE))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn count_by_status(&self) -> Result<HashMap<SagaStatus, u64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM sagas GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let total: i64 = row.try_get("total")?;
            counts.insert(status.parse::<SagaStatus>()?, total as u64);
        }
        Ok(counts)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let terminal: Vec<String> = SagaStatus::ALL
            .iter()
            .filter(|status| status.is_terminal())
            .map(|status| status.as_str().to_string())
            .collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM processed_messages
            WHERE saga_id IN (
                SELECT saga_id FROM sagas WHERE status = ANY($1) AND end_time < $2
            )
            "#,
        )
        .bind(&terminal)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let purged = sqlx::query("DELETE FROM sagas WHERE status = ANY($1) AND end_time < $2")
            .bind(&terminal)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(purged)
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresSagaStore {
    async fn is_processed(&self, message_id: Option<&MessageId>, key: &LedgerKey) -> Result<bool> {
        Ok(self.processed_result(message_id, key).await?.is_some())
    }

    async fn processed_result(
        &self,
        message_id: Option<&MessageId>,
        key: &LedgerKey,
    ) -> Result<Option<serde_json::Value>> {
        let result: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT result FROM processed_messages
            WHERE message_id = $1
               OR (saga_id = $2 AND step_id = $3 AND action_type = $4 AND message_type = $5 AND attempt = $6)
            ORDER BY processed_at ASC
            LIMIT 1
            "#,
        )
        .bind(message_id.map(MessageId::as_str))
        .bind(key.saga_id.as_str())
        .bind(key.step_id)
        .bind(key.action_type.as_str())
        .bind(&key.message_type)
        .bind(key.attempt)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }

    async fn record_processed(&self, record: ProcessedMessage) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = Self::insert_processed(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn is_step_processed(&self, saga_id: &SagaId, step_id: i32) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM processed_messages WHERE saga_id = $1 AND step_id = $2)",
        )
        .bind(saga_id.as_str())
        .bind(step_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn processed_result_for_step(
        &self,
        saga_id: &SagaId,
        step_id: i32,
    ) -> Result<Option<serde_json::Value>> {
        let result: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT result FROM processed_messages
            WHERE saga_id = $1 AND step_id = $2
            ORDER BY processed_at DESC
            LIMIT 1
            "#,
        )
        .bind(saga_id.as_str())
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }

    async fn processed_messages_for_saga(&self, saga_id: &SagaId) -> Result<Vec<ProcessedMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM processed_messages WHERE saga_id = $1 ORDER BY processed_at ASC"
        ))
        .bind(saga_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_processed).collect()
    }

    async fn processed_message_count(&self, saga_id: &SagaId) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM processed_messages WHERE saga_id = $1")
                .bind(saga_id.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn cleanup_saga(&self, saga_id: &SagaId) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM processed_messages WHERE saga_id = $1")
            .bind(saga_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM processed_messages WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn commit(
        &self,
        saga: &SagaState,
        processed: Option<ProcessedMessage>,
        options: CommitOptions,
    ) -> Result<i64> {
        let completed_steps = serde_json::to_value(&saga.completed_steps)?;
        let events = serde_json::to_value(&saga.events)?;

        let mut tx = self.pool.begin().await?;

        // Lock the row so the version check and the update see the same state
        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM sagas WHERE saga_id = $1 FOR UPDATE")
                .bind(saga.saga_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        let current = current.ok_or_else(|| StoreError::NotFound(saga.saga_id.clone()))?;

        if let Some(expected) = options.expected_version
            && current != expected
        {
            return Err(StoreError::ConcurrencyConflict {
                saga_id: saga.saga_id.clone(),
                expected,
                actual: current,
            });
        }

        let next_version = current + 1;
        sqlx::query(
            r#"
            UPDATE sagas SET
                current_step = $2,
                status = $3,
                completed_steps = $4,
                events = $5,
                current_step_start_time = $6,
                last_updated_time = $7,
                end_time = $8,
                retry_count = $9,
                compensation_retry_count = $10,
                failure_reason = $11,
                payment_transaction_id = $12,
                version = $13
            WHERE saga_id = $1
            "#,
        )
        .bind(saga.saga_id.as_str())
        .bind(saga.current_step.as_str())
        .bind(saga.status.as_str())
        .bind(completed_steps)
        .bind(events)
        .bind(saga.current_step_start_time)
        .bind(saga.last_updated_time)
        .bind(saga.end_time)
        .bind(saga.retry_count as i32)
        .bind(saga.compensation_retry_count as i32)
        .bind(&saga.failure_reason)
        .bind(&saga.payment_transaction_id)
        .bind(next_version)
        .execute(&mut *tx)
        .await?;

        if let Some(record) = processed
            && !Self::insert_processed(&mut tx, &record).await?
        {
            tracing::debug!(
                saga_id = %record.saga_id,
                message_id = %record.message_id,
                "ledger row already present, skipping"
            );
        }

        tx.commit().await?;
        Ok(next_version)
    }
}
