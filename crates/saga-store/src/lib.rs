//! Persistence for saga state and the idempotency ledger.
//!
//! Two implementations share the [`SagaStore`] trait:
//! - [`InMemorySagaStore`] for tests and single-process deployments
//! - [`PostgresSagaStore`] backed by the `sagas` and `processed_messages` tables
//!
//! A saga update and the ledger row for the message that caused it are
//! written by one [`SagaStore::commit`] call, so a crash can never leave a
//! message applied but unrecorded, or recorded but unapplied.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use store::{CommitOptions, IdempotencyLedger, SagaRepository, SagaStore, SagaStoreExt};
