//! Lease-based mutual exclusion for orchestration actions.
//!
//! A lock is a named lease with a TTL. Every successful acquisition of a key
//! hands out a fencing token that is strictly greater than any token issued
//! for that key before, so a resource that remembers the highest token it
//! has accepted can turn away a holder whose lease silently expired.
//!
//! Implementations:
//! - [`InMemoryLockStore`] shared by any number of [`InMemoryLock`] clients
//! - [`PostgresLock`] backed by the `saga_locks` tables

pub mod error;
pub mod keys;
pub mod lock;
pub mod memory;
pub mod postgres;

pub use error::{LockError, Result};
pub use lock::{DistributedLock, FencingToken, LockGrant, LockInfo, generate_holder_id};
pub use keys::{order_lock_key, payment_lock_key, saga_lock_key};
pub use memory::{InMemoryLock, InMemoryLockStore};
pub use postgres::PostgresLock;
