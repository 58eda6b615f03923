use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    Result,
    lock::{DistributedLock, FencingToken, LockGrant, LockInfo, generate_holder_id, lease_duration},
};

#[derive(Default)]
struct LockTable {
    leases: HashMap<String, LockInfo>,
    sequences: HashMap<String, i64>,
    resource_tokens: HashMap<String, i64>,
}

/// Lock state shared by every [`InMemoryLock`] client created from it.
#[derive(Clone, Default)]
pub struct InMemoryLockStore {
    table: Arc<Mutex<LockTable>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client acting under `holder_id`.
    pub fn client(&self, holder_id: impl Into<String>) -> InMemoryLock {
        InMemoryLock {
            holder_id: holder_id.into(),
            store: self.clone(),
        }
    }

    /// Number of live leases.
    pub async fn lease_count(&self) -> usize {
        let now = Utc::now();
        let table = self.table.lock().await;
        table.leases.values().filter(|l| !l.is_expired(now)).count()
    }
}

/// In-memory lock client.
#[derive(Clone)]
pub struct InMemoryLock {
    holder_id: String,
    store: InMemoryLockStore,
}

impl InMemoryLock {
    /// Creates a client with its own private store and a generated holder id.
    pub fn new() -> Self {
        InMemoryLockStore::new().client(generate_holder_id())
    }

    pub fn store(&self) -> &InMemoryLockStore {
        &self.store
    }
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    fn holder_id(&self) -> &str {
        &self.holder_id
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<LockGrant> {
        let lease = lease_duration(ttl)?;
        let now = Utc::now();
        let mut table = self.store.table.lock().await;

        if let Some(existing) = table.leases.get(key)
            && !existing.is_expired(now)
        {
            tracing::debug!(key, holder = %existing.holder_id, "lock busy");
            return Ok(LockGrant::refused());
        }

        let sequence = table.sequences.entry(key.to_string()).or_insert(0);
        *sequence += 1;
        let token = FencingToken::new(*sequence);

        table.leases.insert(
            key.to_string(),
            LockInfo {
                key: key.to_string(),
                holder_id: self.holder_id.clone(),
                fencing_token: token,
                acquired_at: now,
                expires_at: now + lease,
            },
        );
        tracing::debug!(key, fencing_token = %token, "lock acquired");
        Ok(LockGrant::granted(token))
    }

    async fn release(&self, key: &str, token: FencingToken) -> Result<bool> {
        let mut table = self.store.table.lock().await;
        let matches = table
            .leases
            .get(key)
            .is_some_and(|lease| lease.fencing_token == token);
        if matches {
            table.leases.remove(key);
        } else {
            tracing::debug!(key, token = %token, "release refused, token does not match");
        }
        Ok(matches)
    }

    async fn extend(&self, key: &str, token: FencingToken, ttl: Duration) -> Result<bool> {
        let lease = lease_duration(ttl)?;
        let now = Utc::now();
        let mut table = self.store.table.lock().await;
        match table.leases.get_mut(key) {
            Some(info) if info.fencing_token == token && !info.is_expired(now) => {
                info.expires_at = now + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<LockInfo>> {
        let now = Utc::now();
        let table = self.store.table.lock().await;
        Ok(table
            .leases
            .get(key)
            .filter(|lease| !lease.is_expired(now))
            .cloned())
    }

    async fn validate_fencing_token(&self, resource: &str, token: FencingToken) -> Result<bool> {
        let mut table = self.store.table.lock().await;
        let highest = table.resource_tokens.entry(resource.to_string()).or_insert(0);
        if token.sequence() < *highest {
            tracing::warn!(resource, token = %token, highest = *highest, "stale fencing token rejected");
            return Ok(false);
        }
        *highest = token.sequence();
        Ok(true)
    }

    async fn held_keys(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let table = self.store.table.lock().await;
        Ok(table
            .leases
            .values()
            .filter(|lease| lease.holder_id == self.holder_id && !lease.is_expired(now))
            .map(|lease| lease.key.clone())
            .collect())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut table = self.store.table.lock().await;
        let before = table.leases.len();
        table.leases.retain(|_, lease| !lease.is_expired(now));
        Ok((before - table.leases.len()) as u64)
    }
}
