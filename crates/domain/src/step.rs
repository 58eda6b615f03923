//! Saga steps, the commands they issue and the events that answer them.
//!
//! The whole flow is described by one static table. Each row names the
//! command a step publishes, the reply events that complete or fail it, and
//! the step that follows in the forward or compensation direction.
//!
//! ```text
//! forward:       PROCESS_PAYMENT ─► UPDATE_ORDER_CONFIRMED ─► UPDATE_ORDER_DELIVERED ─► COMPLETE
//! compensation:  CANCEL_PAYMENT ─► CANCEL_ORDER ─► COMPLETE
//! ```

use serde::{Deserialize, Serialize};

use crate::error::SagaModelError;

/// The downstream service a command is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Payment,
    Order,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Payment => "payment",
            Capability::Order => "order",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A step of the order purchase saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStep {
    ProcessPayment,
    UpdateOrderConfirmed,
    UpdateOrderDelivered,
    /// Sentinel marking the end of either direction.
    Complete,
    CancelPayment,
    CancelOrder,
}

/// Commands the orchestrator issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    PaymentProcess,
    OrderUpdateConfirmed,
    OrderUpdateDelivered,
    PaymentReverse,
    OrderCancel,
}

/// Reply events the orchestrator consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    PaymentProcessed,
    PaymentFailed,
    OrderStatusUpdatedConfirmed,
    OrderStatusUpdatedDelivered,
    OrderStatusUpdateFailed,
    PaymentReversed,
    PaymentReverseFailed,
    OrderCancelled,
    OrderCancellationFailed,
}

/// One row of the step table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDefinition {
    pub step: SagaStep,
    pub number: i32,
    pub description: &'static str,
    pub command: Option<CommandType>,
    pub success_event: Option<EventType>,
    /// Failure reply. `UPDATE_ORDER_CONFIRMED` and `UPDATE_ORDER_DELIVERED`
    /// share `ORDER_STATUS_UPDATE_FAILED`, so it only resolves a step when
    /// read together with the saga's current step.
    pub failure_event: Option<EventType>,
    pub next_step: Option<SagaStep>,
    pub next_compensation_step: Option<SagaStep>,
    pub compensable: bool,
}

static STEP_TABLE: [StepDefinition; 6] = [
    StepDefinition {
        step: SagaStep::ProcessPayment,
        number: 1,
        description: "Process payment",
        command: Some(CommandType::PaymentProcess),
        success_event: Some(EventType::PaymentProcessed),
        failure_event: Some(EventType::PaymentFailed),
        next_step: Some(SagaStep::UpdateOrderConfirmed),
        next_compensation_step: None,
        compensable: true,
    },
    StepDefinition {
        step: SagaStep::UpdateOrderConfirmed,
        number: 2,
        description: "Update order status to CONFIRMED",
        command: Some(CommandType::OrderUpdateConfirmed),
        success_event: Some(EventType::OrderStatusUpdatedConfirmed),
        failure_event: Some(EventType::OrderStatusUpdateFailed),
        next_step: Some(SagaStep::UpdateOrderDelivered),
        next_compensation_step: None,
        compensable: true,
    },
    StepDefinition {
        step: SagaStep::UpdateOrderDelivered,
        number: 3,
        description: "Update order status to DELIVERED",
        command: Some(CommandType::OrderUpdateDelivered),
        success_event: Some(EventType::OrderStatusUpdatedDelivered),
        failure_event: Some(EventType::OrderStatusUpdateFailed),
        next_step: Some(SagaStep::Complete),
        next_compensation_step: None,
        compensable: true,
    },
    StepDefinition {
        step: SagaStep::Complete,
        number: 4,
        description: "Saga completed",
        command: None,
        success_event: None,
        failure_event: None,
        next_step: None,
        next_compensation_step: None,
        compensable: false,
    },
    StepDefinition {
        step: SagaStep::CancelPayment,
        number: 101,
        description: "Reverse payment",
        command: Some(CommandType::PaymentReverse),
        success_event: Some(EventType::PaymentReversed),
        failure_event: Some(EventType::PaymentReverseFailed),
        next_step: None,
        next_compensation_step: Some(SagaStep::CancelOrder),
        compensable: false,
    },
    StepDefinition {
        step: SagaStep::CancelOrder,
        number: 102,
        description: "Cancel order",
        command: Some(CommandType::OrderCancel),
        success_event: Some(EventType::OrderCancelled),
        failure_event: Some(EventType::OrderCancellationFailed),
        next_step: None,
        next_compensation_step: Some(SagaStep::Complete),
        compensable: false,
    },
];

impl SagaStep {
    /// Forward steps in execution order.
    pub const FORWARD: [SagaStep; 3] = [
        SagaStep::ProcessPayment,
        SagaStep::UpdateOrderConfirmed,
        SagaStep::UpdateOrderDelivered,
    ];

    /// Returns this step's row in the step table.
    pub fn definition(self) -> &'static StepDefinition {
        let index = match self {
            SagaStep::ProcessPayment => 0,
            SagaStep::UpdateOrderConfirmed => 1,
            SagaStep::UpdateOrderDelivered => 2,
            SagaStep::Complete => 3,
            SagaStep::CancelPayment => 4,
            SagaStep::CancelOrder => 5,
        };
        &STEP_TABLE[index]
    }

    /// Every row of the step table.
    pub fn table() -> &'static [StepDefinition] {
        &STEP_TABLE
    }

    pub fn number(self) -> i32 {
        self.definition().number
    }

    pub fn from_number(number: i32) -> Option<SagaStep> {
        STEP_TABLE
            .iter()
            .find(|def| def.number == number)
            .map(|def| def.step)
    }

    pub fn command(self) -> Option<CommandType> {
        self.definition().command
    }

    pub fn next_step(self) -> Option<SagaStep> {
        self.definition().next_step
    }

    pub fn next_compensation_step(self) -> Option<SagaStep> {
        self.definition().next_compensation_step
    }

    /// Returns true if a completed instance of this step must be undone.
    pub fn is_compensable(self) -> bool {
        self.definition().compensable
    }

    /// Returns true for the reverse-direction steps.
    pub fn is_compensation(self) -> bool {
        matches!(self, SagaStep::CancelPayment | SagaStep::CancelOrder)
    }

    /// Returns true if `event` is the success reply for this step.
    pub fn is_success_event(self, event: EventType) -> bool {
        self.definition().success_event == Some(event)
    }

    /// Returns true if `event` is the failure reply for this step.
    pub fn is_failure_event(self, event: EventType) -> bool {
        self.definition().failure_event == Some(event)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::ProcessPayment => "PROCESS_PAYMENT",
            SagaStep::UpdateOrderConfirmed => "UPDATE_ORDER_CONFIRMED",
            SagaStep::UpdateOrderDelivered => "UPDATE_ORDER_DELIVERED",
            SagaStep::Complete => "COMPLETE",
            SagaStep::CancelPayment => "CANCEL_PAYMENT",
            SagaStep::CancelOrder => "CANCEL_ORDER",
        }
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStep {
    type Err = SagaModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STEP_TABLE
            .iter()
            .map(|def| def.step)
            .find(|step| step.as_str() == s)
            .ok_or_else(|| SagaModelError::UnknownStep(s.to_string()))
    }
}

/// Picks where compensation starts.
///
/// Payment is only reversed if it was actually taken; the order is always
/// cancelled.
pub fn first_compensation_step(completed_steps: &[SagaStep]) -> SagaStep {
    if completed_steps.contains(&SagaStep::ProcessPayment) {
        SagaStep::CancelPayment
    } else {
        SagaStep::CancelOrder
    }
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::PaymentProcess => "PAYMENT_PROCESS",
            CommandType::OrderUpdateConfirmed => "ORDER_UPDATE_CONFIRMED",
            CommandType::OrderUpdateDelivered => "ORDER_UPDATE_DELIVERED",
            CommandType::PaymentReverse => "PAYMENT_REVERSE",
            CommandType::OrderCancel => "ORDER_CANCEL",
        }
    }

    /// The service that executes this command.
    pub fn capability(&self) -> Capability {
        match self {
            CommandType::PaymentProcess | CommandType::PaymentReverse => Capability::Payment,
            CommandType::OrderUpdateConfirmed
            | CommandType::OrderUpdateDelivered
            | CommandType::OrderCancel => Capability::Order,
        }
    }

    pub fn is_compensation(&self) -> bool {
        matches!(self, CommandType::PaymentReverse | CommandType::OrderCancel)
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::PaymentProcessed,
        EventType::PaymentFailed,
        EventType::OrderStatusUpdatedConfirmed,
        EventType::OrderStatusUpdatedDelivered,
        EventType::OrderStatusUpdateFailed,
        EventType::PaymentReversed,
        EventType::PaymentReverseFailed,
        EventType::OrderCancelled,
        EventType::OrderCancellationFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentProcessed => "PAYMENT_PROCESSED",
            EventType::PaymentFailed => "PAYMENT_FAILED",
            EventType::OrderStatusUpdatedConfirmed => "ORDER_STATUS_UPDATED_CONFIRMED",
            EventType::OrderStatusUpdatedDelivered => "ORDER_STATUS_UPDATED_DELIVERED",
            EventType::OrderStatusUpdateFailed => "ORDER_STATUS_UPDATE_FAILED",
            EventType::PaymentReversed => "PAYMENT_REVERSED",
            EventType::PaymentReverseFailed => "PAYMENT_REVERSE_FAILED",
            EventType::OrderCancelled => "ORDER_CANCELLED",
            EventType::OrderCancellationFailed => "ORDER_CANCELLATION_FAILED",
        }
    }

    /// Returns true if this event reports a step that succeeded.
    pub fn is_success(&self) -> bool {
        STEP_TABLE
            .iter()
            .any(|def| def.success_event == Some(*self))
    }

    /// Returns true if this event answers a compensation command.
    pub fn answers_compensation(&self) -> bool {
        matches!(
            self,
            EventType::PaymentReversed
                | EventType::PaymentReverseFailed
                | EventType::OrderCancelled
                | EventType::OrderCancellationFailed
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = SagaModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| SagaModelError::UnknownEventType(s.to_string()))
    }
}
