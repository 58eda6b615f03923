use std::time::Duration;

use thiserror::Error;

/// Errors from the lock backend.
///
/// A lock held by someone else is not an error; `try_acquire` reports it
/// as a refused [`LockGrant`](crate::LockGrant).
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock store could not be reached or rejected the query.
    #[error("Lock backend error: {0}")]
    Backend(#[from] sqlx::Error),

    /// A lease must have a positive duration.
    #[error("Invalid lock TTL: {0:?}")]
    InvalidTtl(Duration),
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;
