//! Saga lifecycle status.

use serde::{Deserialize, Serialize};

use crate::error::SagaModelError;

/// The status of a saga in its lifecycle.
///
/// Status transitions:
/// ```text
/// STARTED ──► IN_PROGRESS ──► COMPLETED
///    │             │
///    └──► FAILED ◄─┘
///           │
///           ├──► COMPENSATING ──┬──► COMPENSATION_COMPLETED
///           │                   └──► COMPENSATION_FAILED
///           └──► COMPENSATION_COMPLETED
/// ```
///
/// `FAILED` is a transient status: the orchestrator moves out of it within
/// the same commit, so it is never observed at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Created; the first command has been issued.
    #[default]
    Started,

    /// At least one forward step has completed.
    InProgress,

    /// All forward steps succeeded (terminal).
    Completed,

    /// A forward step failed and compensation has not begun yet.
    Failed,

    /// Compensating commands are being issued in reverse order.
    Compensating,

    /// All required compensations succeeded (terminal).
    CompensationCompleted,

    /// Compensation exhausted its retries (terminal).
    CompensationFailed,
}

impl SagaStatus {
    /// Statuses the saga can still make progress from.
    pub const ACTIVE: [SagaStatus; 3] = [
        SagaStatus::Started,
        SagaStatus::InProgress,
        SagaStatus::Compensating,
    ];

    /// Every status, in diagram order.
    pub const ALL: [SagaStatus; 7] = [
        SagaStatus::Started,
        SagaStatus::InProgress,
        SagaStatus::Completed,
        SagaStatus::Failed,
        SagaStatus::Compensating,
        SagaStatus::CompensationCompleted,
        SagaStatus::CompensationFailed,
    ];

    /// Returns true if the saga still accepts events.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SagaStatus::Started | SagaStatus::InProgress | SagaStatus::Compensating
        )
    }

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::CompensationCompleted
                | SagaStatus::CompensationFailed
        )
    }

    /// Returns true if `next` is an edge of the status diagram.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Started, InProgress)
                | (Started, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, Compensating)
                | (Failed, CompensationCompleted)
                | (Compensating, CompensationCompleted)
                | (Compensating, CompensationFailed)
        )
    }

    /// Returns the status name as it appears on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Started => "STARTED",
            SagaStatus::InProgress => "IN_PROGRESS",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::CompensationCompleted => "COMPENSATION_COMPLETED",
            SagaStatus::CompensationFailed => "COMPENSATION_FAILED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = SagaModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SagaModelError::UnknownStatus(s.to_string()))
    }
}
