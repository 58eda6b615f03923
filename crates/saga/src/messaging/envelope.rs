//! The message envelope shared by commands and events.

use chrono::Utc;
use common::{MessageId, SagaId};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};

/// Wire shape of every command and event.
///
/// ```json
/// {"messageId": "MSG-...", "sagaId": "ORDER_PURCHASE-...", "stepId": 1,
///  "type": "PAYMENT_PROCESS", "timestamp": 1718000000000, "payload": {...}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<SagaId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<i32>,
    #[serde(rename = "type", default)]
    pub message_type: String,
    /// Epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl MessageEnvelope {
    /// Creates an envelope stamped with the current time.
    pub fn new(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_id: None,
            saga_id: None,
            step_id: None,
            message_type: message_type.into(),
            timestamp: Utc::now().timestamp_millis(),
            payload,
        }
    }

    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_saga(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    pub fn with_step(mut self, step_id: i32) -> Self {
        self.step_id = Some(step_id);
        self
    }

    /// Returns the saga id, rejecting envelopes that carry none.
    pub fn require_saga_id(&self) -> Result<&SagaId> {
        self.saga_id
            .as_ref()
            .filter(|id| !id.as_str().is_empty())
            .ok_or_else(|| {
                SagaError::InvalidMessage(format!("{} envelope has no sagaId", self.type_name()))
            })
    }

    /// Returns the message type, rejecting envelopes that carry none.
    pub fn require_type(&self) -> Result<&str> {
        if self.message_type.is_empty() {
            return Err(SagaError::InvalidMessage(
                "envelope has no type".to_string(),
            ));
        }
        Ok(&self.message_type)
    }

    /// Reads a string field of the payload. Numbers are rendered as text.
    pub fn payload_str(&self, field: &str) -> Option<String> {
        payload_text(&self.payload, field)
    }

    fn type_name(&self) -> &str {
        if self.message_type.is_empty() {
            "untyped"
        } else {
            &self.message_type
        }
    }
}

/// Reads a non-empty text field of a payload. Numbers are rendered as text.
pub fn payload_text(payload: &serde_json::Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
