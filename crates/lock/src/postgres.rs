use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    Result,
    lock::{DistributedLock, FencingToken, LockGrant, LockInfo, generate_holder_id, lease_duration},
};

/// PostgreSQL-backed lock client.
///
/// Leases live in `saga_locks`; `lock_fencing_sequences` keeps the last
/// token per key so tokens keep increasing after a lease is released.
/// All lease times come from the database clock.
#[derive(Clone)]
pub struct PostgresLock {
    pool: PgPool,
    holder_id: String,
}

impl PostgresLock {
    /// Creates a client with a generated holder id.
    pub fn new(pool: PgPool) -> Self {
        Self::with_holder_id(pool, generate_holder_id())
    }

    /// Creates a client acting under `holder_id`.
    pub fn with_holder_id(pool: PgPool, holder_id: impl Into<String>) -> Self {
        Self {
            pool,
            holder_id: holder_id.into(),
        }
    }

    fn row_to_info(row: PgRow) -> Result<LockInfo> {
        Ok(LockInfo {
            key: row.try_get("lock_key")?,
            holder_id: row.try_get("holder_id")?,
            fencing_token: FencingToken::new(row.try_get("fencing_token")?),
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

fn ttl_seconds(ttl: Duration) -> Result<f64> {
    lease_duration(ttl)?;
    Ok(ttl.as_secs_f64())
}

#[async_trait]
impl DistributedLock for PostgresLock {
    fn holder_id(&self) -> &str {
        &self.holder_id
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<LockGrant> {
        let seconds = ttl_seconds(ttl)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM saga_locks WHERE lock_key = $1 AND expires_at <= NOW()")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        // Serializes concurrent acquirers of the same key on the sequence row
        let token: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO lock_fencing_sequences (lock_key, last_token)
            VALUES ($1, 1)
            ON CONFLICT (lock_key) DO UPDATE SET last_token = lock_fencing_sequences.last_token + 1
            RETURNING last_token
            "#,
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO saga_locks (lock_key, holder_id, fencing_token, acquired_at, expires_at)
            VALUES ($1, $2, $3, NOW(), NOW() + make_interval(secs => $4))
            ON CONFLICT (lock_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(&self.holder_id)
        .bind(token)
        .bind(seconds)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            tracing::debug!(key, "lock busy");
            return Ok(LockGrant::refused());
        }

        tx.commit().await?;
        tracing::debug!(key, fencing_token = token, "lock acquired");
        Ok(LockGrant::granted(FencingToken::new(token)))
    }

    async fn release(&self, key: &str, token: FencingToken) -> Result<bool> {
        let released =
            sqlx::query("DELETE FROM saga_locks WHERE lock_key = $1 AND fencing_token = $2")
                .bind(key)
                .bind(token.sequence())
                .execute(&self.pool)
                .await?
                .rows_affected();
        if released == 0 {
            tracing::debug!(key, token = %token, "release refused, token does not match");
        }
        Ok(released == 1)
    }

    async fn extend(&self, key: &str, token: FencingToken, ttl: Duration) -> Result<bool> {
        let seconds = ttl_seconds(ttl)?;
        let extended = sqlx::query(
            r#"
            UPDATE saga_locks SET expires_at = NOW() + make_interval(secs => $3)
            WHERE lock_key = $1 AND fencing_token = $2 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .bind(token.sequence())
        .bind(seconds)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(extended == 1)
    }

    async fn holder(&self, key: &str) -> Result<Option<LockInfo>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT lock_key, holder_id, fencing_token, acquired_at, expires_at
            FROM saga_locks
            WHERE lock_key = $1 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_info).transpose()
    }

    async fn validate_fencing_token(&self, resource: &str, token: FencingToken) -> Result<bool> {
        let accepted = sqlx::query(
            r#"
            INSERT INTO lock_resource_tokens (resource, highest_token, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (resource) DO UPDATE
                SET highest_token = EXCLUDED.highest_token, updated_at = NOW()
                WHERE lock_resource_tokens.highest_token <= EXCLUDED.highest_token
            "#,
        )
        .bind(resource)
        .bind(token.sequence())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if accepted == 0 {
            tracing::warn!(resource, token = %token, "stale fencing token rejected");
        }
        Ok(accepted == 1)
    }

    async fn held_keys(&self) -> Result<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT lock_key FROM saga_locks WHERE holder_id = $1 AND expires_at > NOW()",
        )
        .bind(&self.holder_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM saga_locks WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(purged)
    }

    async fn release_all(&self) -> Result<u64> {
        let released = sqlx::query("DELETE FROM saga_locks WHERE holder_id = $1")
            .bind(&self.holder_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(released)
    }
}
