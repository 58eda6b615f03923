//! Domain model for the order purchase saga.
//!
//! This crate is free of I/O. It provides:
//! - `SagaState`, the durable record of one transaction, with guarded transitions
//! - `SagaStatus` and its allowed edges
//! - The step table mapping each `SagaStep` to its command and reply events
//! - `ProcessedMessage`, the idempotency ledger record

pub mod audit;
pub mod error;
pub mod ledger;
pub mod saga;
pub mod status;
pub mod step;

pub use audit::{AuditEvent, AuditKind};
pub use error::{Result, SagaModelError};
pub use ledger::{ActionType, LedgerKey, ProcessedMessage};
pub use saga::{CompensationOutcome, NewSaga, RetryLimits, SagaState};
pub use status::SagaStatus;
pub use step::{
    Capability, CommandType, EventType, SagaStep, StepDefinition, first_compensation_step,
};
