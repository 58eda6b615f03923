use common::SagaId;
use domain::SagaModelError;
use thiserror::Error;

/// Errors that can occur when reading or writing sagas.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version did not match the version the caller loaded.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: i64,
        actual: i64,
    },

    /// The saga does not exist.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// Another saga is already active for the order.
    #[error("Order {order_id} already has an active saga")]
    DuplicateOrder { order_id: i64 },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value did not map back to the saga model.
    #[error("Corrupt saga row: {0}")]
    Model(#[from] SagaModelError),
}

impl StoreError {
    /// Returns true for errors a caller may resolve by reloading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
