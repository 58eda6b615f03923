//! Idempotency ledger records.
//!
//! A message counts as processed when either its message id or its
//! structural key is present in the ledger. The structural key is
//! `(saga_id, step_id, action_type)` refined by the reply type and the
//! attempt number, so a redelivered reply is caught even when the bus
//! assigned it a fresh message id. A reply without a message id is keyed
//! with attempt `0` unless it echoes the attempt of its command.

use chrono::{DateTime, Utc};
use common::{MessageId, SagaId};
use serde::{Deserialize, Serialize};

use crate::error::SagaModelError;

/// Direction of the step a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Forward,
    Compensation,
}

impl ActionType {
    /// Classifies a message type by name.
    ///
    /// Any name mentioning `FAILED`, `COMPENSATION` or `ROLLBACK` is treated
    /// as compensation. Note this classifies `PAYMENT_FAILED` as
    /// compensation even though it answers a forward command.
    pub fn for_message_type(message_type: &str) -> ActionType {
        if message_type.contains("FAILED")
            || message_type.contains("COMPENSATION")
            || message_type.contains("ROLLBACK")
        {
            ActionType::Compensation
        } else {
            ActionType::Forward
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Forward => "FORWARD",
            ActionType::Compensation => "COMPENSATION",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = SagaModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FORWARD" => Ok(ActionType::Forward),
            "COMPENSATION" => Ok(ActionType::Compensation),
            other => Err(SagaModelError::UnknownActionType(other.to_string())),
        }
    }
}

/// Structural identity of a processed message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub saga_id: SagaId,
    pub step_id: i32,
    pub action_type: ActionType,
    pub message_type: String,
    /// Retry counter of the phase the message answered.
    pub attempt: i32,
}

impl LedgerKey {
    pub fn new(
        saga_id: SagaId,
        step_id: i32,
        message_type: impl Into<String>,
        attempt: i32,
    ) -> Self {
        let message_type = message_type.into();
        Self {
            saga_id,
            step_id,
            action_type: ActionType::for_message_type(&message_type),
            message_type,
            attempt,
        }
    }

    /// Message id used when the incoming message carried none.
    pub fn derived_message_id(&self) -> MessageId {
        let qualifier = format!("{}-{}", self.message_type, self.attempt);
        MessageId::for_step_reply(&self.saga_id, self.step_id, &qualifier)
    }
}

/// A ledger row: one message that was applied, and what applying it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedMessage {
    pub message_id: MessageId,
    pub saga_id: SagaId,
    pub step_id: i32,
    pub action_type: ActionType,
    pub message_type: String,
    pub attempt: i32,
    pub result: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedMessage {
    /// Builds a ledger row for `key`, falling back to the derived message id.
    pub fn new(message_id: Option<MessageId>, key: LedgerKey, result: serde_json::Value) -> Self {
        let message_id = message_id.unwrap_or_else(|| key.derived_message_id());
        Self {
            message_id,
            saga_id: key.saga_id,
            step_id: key.step_id,
            action_type: key.action_type,
            message_type: key.message_type,
            attempt: key.attempt,
            result,
            processed_at: Utc::now(),
        }
    }

    /// Returns the structural key of this row.
    pub fn key(&self) -> LedgerKey {
        LedgerKey {
            saga_id: self.saga_id.clone(),
            step_id: self.step_id,
            action_type: self.action_type,
            message_type: self.message_type.clone(),
            attempt: self.attempt,
        }
    }
}
