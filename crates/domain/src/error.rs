//! Domain error types.

use common::SagaId;
use thiserror::Error;

use crate::status::SagaStatus;

/// Errors raised by the saga model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SagaModelError {
    /// The requested status change is not an edge of the state diagram.
    #[error("Invalid transition for saga {saga_id}: {from} -> {to}")]
    InvalidTransition {
        saga_id: SagaId,
        from: SagaStatus,
        to: SagaStatus,
    },

    /// A step name or number did not match any known step.
    #[error("Unknown saga step: {0}")]
    UnknownStep(String),

    /// A status name did not match any known status.
    #[error("Unknown saga status: {0}")]
    UnknownStatus(String),

    /// An event type name did not match any known reply event.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// An action type name was neither FORWARD nor COMPENSATION.
    #[error("Unknown action type: {0}")]
    UnknownActionType(String),
}

/// Convenience type alias for model results.
pub type Result<T> = std::result::Result<T, SagaModelError>;
