//! Orchestration of the order purchase saga.
//!
//! The saga runs three forward steps, each a command to a remote service
//! answered by a success or failure event:
//! 1. Process payment
//! 2. Update order status to CONFIRMED
//! 3. Update order status to DELIVERED
//!
//! If a step fails, or times out after its retries, completed work is undone
//! by compensation steps: reverse the payment if one was taken, then cancel
//! the order. A compensation step that keeps failing leaves the saga in
//! `COMPENSATION_FAILED` for an operator.
//!
//! Long-lived pieces are explicit tasks owned by the caller:
//! - [`PartitionedDispatcher`] feeding inbound envelopes to the orchestrator
//! - [`TimeoutSupervisor`] sweeping for stuck steps
//! - [`MaintenanceJob`] evicting old ledger rows and purging finished sagas

pub mod commands;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod messaging;
pub mod monitoring;
pub mod orchestrator;
pub mod supervisor;

pub use config::{SagaConfig, Topics};
pub use error::{Result, SagaError};
pub use maintenance::{MaintenanceJob, MaintenanceReport};
pub use messaging::{
    InMemoryBus, MessageEnvelope, MessageHandler, MessagePublisher, PartitionedDispatcher,
    PublishedMessage,
};
pub use monitoring::{HealthSnapshot, SagaMetrics, SagaMonitor};
pub use orchestrator::{
    EventOutcome, SAGA_EXTERNAL_CANCEL_REQUEST, SAGA_TIMEOUT_CHECK, SagaOrchestrator,
    TimeoutSweep,
};
pub use supervisor::{SchedulerHealth, SupervisorHandle, TimeoutSupervisor, retry_delay};
