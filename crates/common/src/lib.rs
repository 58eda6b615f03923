//! Shared identifiers and value types used across the orchestrator crates.

pub mod ids;
pub mod money;

pub use ids::{MessageId, SagaId};
pub use money::Money;
