//! Saga error types.

use common::SagaId;
use domain::{SagaModelError, SagaStatus};
use lock::LockError;
use saga_store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
///
/// Step failures, step timeouts and compensation failures are not errors:
/// they are recorded on the saga as state transitions.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No saga with this id exists.
    #[error("Saga not found: {saga_id}")]
    NotFound { saga_id: SagaId },

    /// No saga exists for this order.
    #[error("No saga for order {order_id}")]
    OrderNotFound { order_id: i64 },

    /// The saga is in a status that does not allow the operation.
    #[error("Saga {saga_id} cannot do this in status {status}")]
    InvalidTransition { saga_id: SagaId, status: SagaStatus },

    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] StoreError),

    /// Lock backend error.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// The message bus refused a publish.
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An inbound message is missing required fields or names an unknown type.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The saga model rejected an operation.
    #[error("Saga model error: {0}")]
    Model(SagaModelError),

    /// The message dispatcher is no longer accepting work.
    #[error("Dispatcher is shut down")]
    DispatcherClosed,
}

impl SagaError {
    /// Returns true if the error came from a concurrent update of the same saga.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SagaError::Store(e) if e.is_conflict())
    }
}

impl From<SagaModelError> for SagaError {
    fn from(err: SagaModelError) -> Self {
        match err {
            SagaModelError::InvalidTransition { saga_id, from, .. } => {
                SagaError::InvalidTransition {
                    saga_id,
                    status: from,
                }
            }
            other => SagaError::Model(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
