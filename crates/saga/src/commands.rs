//! Outbound command construction.

use common::MessageId;
use domain::{CommandType, SagaState};
use lock::FencingToken;
use serde_json::{Value, json};

use crate::messaging::MessageEnvelope;

/// Builds the command envelope for the saga's current step.
///
/// The message id is derived from the saga, the step and the retry
/// counter, so a re-published retry is distinguishable from the original
/// while a repeated publish of the same attempt is not. The payload's
/// `attempt` is meant to be echoed back on the reply.
pub fn build_command(
    saga: &SagaState,
    command: CommandType,
    fencing_token: FencingToken,
) -> MessageEnvelope {
    let step_id = saga.current_step.number();
    let qualifier = format!("{command}-{}", saga.phase_attempt());
    let message_id = MessageId::for_step_reply(&saga.saga_id, step_id, &qualifier);

    let mut payload = command_payload(saga, command);
    if let Value::Object(fields) = &mut payload {
        fields.insert("fencingToken".to_string(), json!(fencing_token.sequence()));
        fields.insert("attempt".to_string(), json!(saga.phase_attempt()));
    }

    MessageEnvelope::new(command.as_str(), payload)
        .with_message_id(message_id)
        .with_saga(saga.saga_id.clone())
        .with_step(step_id)
}

fn command_payload(saga: &SagaState, command: CommandType) -> Value {
    match command {
        CommandType::PaymentProcess => json!({
            "orderId": saga.order_id,
            "userId": saga.user_id,
            "totalAmount": saga.total_amount.to_string(),
        }),
        CommandType::OrderUpdateConfirmed => json!({
            "orderId": saga.order_id,
            "newStatus": "CONFIRMED",
            "reason": "Payment processed",
        }),
        CommandType::OrderUpdateDelivered => json!({
            "orderId": saga.order_id,
            "newStatus": "DELIVERED",
            "reason": "Order confirmed",
        }),
        CommandType::PaymentReverse => json!({
            "orderId": saga.order_id,
            "paymentTransactionId": saga.payment_transaction_id,
            "reason": compensation_reason(saga),
        }),
        CommandType::OrderCancel => json!({
            "orderId": saga.order_id,
            "reason": compensation_reason(saga),
            "cancelledBy": "SAGA_COMPENSATION",
        }),
    }
}

fn compensation_reason(saga: &SagaState) -> String {
    format!(
        "Saga compensation: {}",
        saga.failure_reason.as_deref().unwrap_or("step failed")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Money, SagaId};
    use domain::{NewSaga, RetryLimits, SagaStep};

    fn saga() -> SagaState {
        SagaState::initiate(
            SagaId::new("saga-1"),
            NewSaga {
                order_id: 500,
                user_id: "user-1".to_string(),
                user_email: "user@example.com".to_string(),
                user_name: "Test User".to_string(),
                description: "Test order".to_string(),
                total_amount: Money::from_cents(12000),
            },
            RetryLimits::default(),
        )
    }

    #[test]
    fn test_payment_command() {
        let saga = saga();
        let envelope = build_command(&saga, CommandType::PaymentProcess, FencingToken::new(7));

        assert_eq!(envelope.message_type, "PAYMENT_PROCESS");
        assert_eq!(envelope.saga_id, Some(SagaId::new("saga-1")));
        assert_eq!(envelope.step_id, Some(1));
        assert_eq!(envelope.payload["orderId"], 500);
        assert_eq!(envelope.payload["userId"], "user-1");
        assert_eq!(envelope.payload["totalAmount"], "120.00");
        assert_eq!(envelope.payload["fencingToken"], 7);
        assert_eq!(envelope.payload["attempt"], 0);
    }

    #[test]
    fn test_message_id_changes_with_retry_only() {
        let mut saga = saga();
        let first = build_command(&saga, CommandType::PaymentProcess, FencingToken::new(1));
        let again = build_command(&saga, CommandType::PaymentProcess, FencingToken::new(2));
        assert_eq!(first.message_id, again.message_id);

        saga.try_retry().unwrap();
        let retried = build_command(&saga, CommandType::PaymentProcess, FencingToken::new(3));
        assert_ne!(first.message_id, retried.message_id);
    }

    #[test]
    fn test_compensation_commands_carry_reason() {
        let mut saga = saga();
        saga.payment_transaction_id = Some("txn-42".to_string());
        saga.complete_forward_step().unwrap();
        saga.fail("order service down").unwrap();
        assert_eq!(saga.begin_compensation().unwrap(), Some(SagaStep::CancelPayment));

        let reverse = build_command(&saga, CommandType::PaymentReverse, FencingToken::new(1));
        assert_eq!(reverse.step_id, Some(101));
        assert_eq!(reverse.payload["paymentTransactionId"], "txn-42");
        assert_eq!(
            reverse.payload["reason"],
            "Saga compensation: order service down"
        );

        let cancel = build_command(&saga, CommandType::OrderCancel, FencingToken::new(2));
        assert_eq!(cancel.payload["cancelledBy"], "SAGA_COMPENSATION");
    }
}
