use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{LockError, Result};

/// Monotonic token identifying one acquisition of a lock key.
///
/// A higher token always belongs to a later acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FencingToken(i64);

impl FencingToken {
    pub fn new(sequence: i64) -> Self {
        Self(sequence)
    }

    pub fn sequence(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for FencingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockGrant {
    pub granted: bool,
    pub fencing_token: Option<FencingToken>,
}

impl LockGrant {
    pub fn granted(token: FencingToken) -> Self {
        Self {
            granted: true,
            fencing_token: Some(token),
        }
    }

    pub fn refused() -> Self {
        Self {
            granted: false,
            fencing_token: None,
        }
    }
}

/// A live lease on a lock key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub key: String,
    pub holder_id: String,
    pub fencing_token: FencingToken,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left on the lease, zero once expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Generates a holder id unique to this process instance.
pub fn generate_holder_id() -> String {
    format!("orchestrator-{}", Uuid::new_v4())
}

pub(crate) fn lease_duration(ttl: Duration) -> Result<chrono::Duration> {
    if ttl.is_zero() {
        return Err(LockError::InvalidTtl(ttl));
    }
    chrono::Duration::from_std(ttl).map_err(|_| LockError::InvalidTtl(ttl))
}

/// A lease-based lock shared by several orchestrator instances.
///
/// Each client has its own holder id. Release and extend are guarded by the
/// fencing token handed out at acquisition, so a holder whose lease expired
/// and was taken over cannot touch the new lease.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Identity this client acquires locks under.
    fn holder_id(&self) -> &str;

    /// Acquires `key` for `ttl` if it is free or its lease has expired.
    ///
    /// A key held by anyone, including this client, is refused.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<LockGrant>;

    /// Releases `key` if its current lease carries `token`. Returns false otherwise.
    async fn release(&self, key: &str, token: FencingToken) -> Result<bool>;

    /// Resets the lease on `key` to `ttl` from now, if the unexpired lease
    /// still carries `token`. Returns false otherwise.
    async fn extend(&self, key: &str, token: FencingToken, ttl: Duration) -> Result<bool>;

    /// Returns the live lease on `key`, if any.
    async fn holder(&self, key: &str) -> Result<Option<LockInfo>>;

    /// Accepts `token` for `resource` if it is at least the highest token
    /// the resource has accepted, and remembers it. Lower tokens are
    /// rejected.
    async fn validate_fencing_token(&self, resource: &str, token: FencingToken) -> Result<bool>;

    /// Keys this client currently holds.
    async fn held_keys(&self) -> Result<Vec<String>>;

    /// Deletes expired leases and returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;

    /// Returns true if `key` has a live lease.
    async fn is_locked(&self, key: &str) -> Result<bool> {
        Ok(self.holder(key).await?.is_some())
    }

    /// Releases every key this client holds and returns how many were released.
    async fn release_all(&self) -> Result<u64> {
        let mut released = 0;
        for key in self.held_keys().await? {
            let Some(lease) = self.holder(&key).await? else {
                continue;
            };
            if lease.holder_id == self.holder_id()
                && self.release(&key, lease.fencing_token).await?
            {
                released += 1;
            }
        }
        Ok(released)
    }
}
