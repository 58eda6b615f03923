use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SAGA_TYPE_PREFIX: &str = "ORDER_PURCHASE";
const MESSAGE_PREFIX: &str = "MSG";

/// Unique identifier for a saga instance.
///
/// Generated ids have the shape `ORDER_PURCHASE-<epochMillis>-<uuid>`, but any
/// non-empty string received from the wire is accepted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(String);

impl SagaId {
    /// Creates a new unique saga ID.
    pub fn generate() -> Self {
        Self(format!(
            "{SAGA_TYPE_PREFIX}-{}-{}",
            Utc::now().timestamp_millis(),
            Uuid::new_v4()
        ))
    }

    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the creation time embedded in a generated ID, in epoch millis.
    pub fn created_at_millis(&self) -> Option<i64> {
        let mut parts = self.0.splitn(3, '-');
        let _prefix = parts.next()?;
        parts.next()?.parse().ok()
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SagaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SagaId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for SagaId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a command or event message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a new random message ID: `MSG-<epochMillis>-<uuid>`.
    pub fn generate() -> Self {
        Self(format!(
            "{MESSAGE_PREFIX}-{}-{}",
            Utc::now().timestamp_millis(),
            Uuid::new_v4()
        ))
    }

    /// Derives the message ID for a saga step.
    ///
    /// The same `(saga_id, step_id)` pair always yields the same ID, so a
    /// retried-but-unacknowledged step re-derives the key it used before.
    pub fn for_saga_step(saga_id: &SagaId, step_id: i32) -> Self {
        let name = format!("{saga_id}-{step_id}");
        let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
            .simple()
            .to_string();
        Self(format!("{MESSAGE_PREFIX}-{saga_id}-{step_id}-{}", &digest[..8]))
    }

    /// Derives an ID for a reply to a saga step that arrived without one.
    ///
    /// `qualifier` distinguishes replies to the same step, e.g. the reply
    /// type and attempt number.
    pub fn for_step_reply(saga_id: &SagaId, step_id: i32, qualifier: &str) -> Self {
        let name = format!("{saga_id}-{step_id}-{qualifier}");
        let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
            .simple()
            .to_string();
        Self(format!("{MESSAGE_PREFIX}-{saga_id}-{step_id}-{}", &digest[..12]))
    }

    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saga_id_generate_creates_unique_ids() {
        let id1 = SagaId::generate();
        let id2 = SagaId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("ORDER_PURCHASE-"));
    }

    #[test]
    fn saga_id_exposes_creation_time() {
        let before = Utc::now().timestamp_millis();
        let id = SagaId::generate();
        let created = id.created_at_millis().unwrap();
        assert!(created >= before);

        assert_eq!(SagaId::new("not-a-number").created_at_millis(), None);
    }

    #[test]
    fn step_message_id_is_deterministic() {
        let saga_id = SagaId::new("ORDER_PURCHASE-1-abc");
        let first = MessageId::for_saga_step(&saga_id, 2);
        let second = MessageId::for_saga_step(&saga_id, 2);
        assert_eq!(first, second);
        assert!(first.as_str().starts_with("MSG-ORDER_PURCHASE-1-abc-2-"));

        let other_step = MessageId::for_saga_step(&saga_id, 3);
        assert_ne!(first, other_step);
    }

    #[test]
    fn reply_ids_differ_by_qualifier() {
        let saga_id = SagaId::new("saga-1");
        let a = MessageId::for_step_reply(&saga_id, 101, "PAYMENT_REVERSE_FAILED-0");
        let b = MessageId::for_step_reply(&saga_id, 101, "PAYMENT_REVERSE_FAILED-1");
        assert_ne!(a, b);
        assert_eq!(a, MessageId::for_step_reply(&saga_id, 101, "PAYMENT_REVERSE_FAILED-0"));
    }

    #[test]
    fn random_message_ids_differ() {
        assert_ne!(MessageId::generate(), MessageId::generate());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = SagaId::new("saga-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"saga-1\"");
        let back: SagaId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
