//! The message boundary: envelopes, publishing and inbound dispatch.

pub mod dispatcher;
pub mod envelope;
pub mod publisher;

pub use dispatcher::{DEFAULT_PARTITION_CAPACITY, MessageHandler, PartitionedDispatcher, partition_for};
pub use envelope::{MessageEnvelope, payload_text};
pub use publisher::{InMemoryBus, MessagePublisher, PublishedMessage};
