//! Saga audit trail entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of an audit trail entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    SagaInitiated,
    StepStarted,
    StepCompleted,
    StepFailed,
    Retry,
    CompensationStarted,
    CompensationStep,
    CompensationStepCompleted,
    CompensationRetry,
    CompensationCompleted,
    CompensationFailed,
    SagaCompleted,
    SagaFailed,
    UserCancellation,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::SagaInitiated => "SAGA_INITIATED",
            AuditKind::StepStarted => "STEP_STARTED",
            AuditKind::StepCompleted => "STEP_COMPLETED",
            AuditKind::StepFailed => "STEP_FAILED",
            AuditKind::Retry => "RETRY",
            AuditKind::CompensationStarted => "COMPENSATION_STARTED",
            AuditKind::CompensationStep => "COMPENSATION_STEP",
            AuditKind::CompensationStepCompleted => "COMPENSATION_STEP_COMPLETED",
            AuditKind::CompensationRetry => "COMPENSATION_RETRY",
            AuditKind::CompensationCompleted => "COMPENSATION_COMPLETED",
            AuditKind::CompensationFailed => "COMPENSATION_FAILED",
            AuditKind::SagaCompleted => "SAGA_COMPLETED",
            AuditKind::SagaFailed => "SAGA_FAILED",
            AuditKind::UserCancellation => "USER_CANCELLATION",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of a saga's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    #[serde(rename = "type")]
    pub kind: AuditKind,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_serializes_type_field() {
        let event = AuditEvent::new(AuditKind::StepStarted, "Starting PROCESS_PAYMENT");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "STEP_STARTED");
        assert_eq!(json["description"], "Starting PROCESS_PAYMENT");
        assert!(json["timestamp"].is_string());
    }
}
