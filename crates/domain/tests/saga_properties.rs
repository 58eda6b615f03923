//! Property tests for the saga state entity.

use common::{Money, SagaId};
use domain::{NewSaga, RetryLimits, SagaState, SagaStatus, SagaStep};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    Succeed,
    Fail,
    Retry,
    Finish,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Succeed),
        Just(Op::Fail),
        Just(Op::Retry),
        Just(Op::Finish),
    ]
}

fn new_saga(limits: RetryLimits) -> SagaState {
    SagaState::initiate(
        SagaId::generate(),
        NewSaga {
            order_id: 1,
            user_id: "user".to_string(),
            user_email: "user@example.com".to_string(),
            user_name: "User".to_string(),
            description: "order".to_string(),
            total_amount: Money::from_cents(100),
        },
        limits,
    )
}

/// Drives the saga the way the orchestrator does for one reply.
fn apply(saga: &mut SagaState, op: Op) {
    match op {
        Op::Succeed if saga.is_compensating() => {
            let _ = saga.complete_compensation_step();
        }
        Op::Succeed => {
            if let Ok(SagaStep::Complete) = saga.complete_forward_step() {
                let _ = saga.finish();
            }
        }
        Op::Fail if saga.is_compensating() => {
            let _ = saga.compensation_failed("failed");
        }
        Op::Fail => {
            if saga.fail("failed").is_ok() {
                let _ = saga.begin_compensation();
            }
        }
        Op::Retry => {
            let _ = saga.try_retry();
        }
        Op::Finish => {
            let _ = saga.finish();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

    #[test]
    fn status_only_moves_along_edges(ops in proptest::collection::vec(op(), 0..40)) {
        let mut saga = new_saga(RetryLimits::default());
        for op in ops {
            let before = saga.status;
            apply(&mut saga, op);
            let after = saga.status;
            if before != after {
                // FAILED is left within the same reply, so allow the two-hop path.
                let direct = before.can_transition_to(after);
                let via_failed = before.can_transition_to(SagaStatus::Failed)
                    && SagaStatus::Failed.can_transition_to(after);
                prop_assert!(direct || via_failed, "{before} -> {after}");
            }
            prop_assert_ne!(saga.status, SagaStatus::Failed);
        }
    }

    #[test]
    fn terminal_status_is_immutable(ops in proptest::collection::vec(op(), 0..40)) {
        let mut saga = new_saga(RetryLimits::default());
        let mut frozen: Option<(SagaStatus, SagaStep, usize)> = None;
        for op in ops {
            apply(&mut saga, op);
            if let Some(snapshot) = frozen {
                prop_assert_eq!(
                    snapshot,
                    (saga.status, saga.current_step, saga.completed_steps.len())
                );
            } else if saga.is_terminal() {
                frozen = Some((saga.status, saga.current_step, saga.completed_steps.len()));
            }
        }
    }

    #[test]
    fn retry_counters_stay_within_budget(
        max_retries in 0u32..5,
        max_compensation_retries in 0u32..5,
        ops in proptest::collection::vec(op(), 0..60),
    ) {
        let mut saga = new_saga(RetryLimits { max_retries, max_compensation_retries });
        for op in ops {
            apply(&mut saga, op);
            prop_assert!(saga.retry_count <= saga.max_retries);
            prop_assert!(saga.compensation_retry_count <= saga.max_compensation_retries);
        }
    }

    #[test]
    fn compensated_sagas_undid_every_forward_step(ops in proptest::collection::vec(op(), 0..40)) {
        let mut saga = new_saga(RetryLimits::default());
        for op in ops {
            apply(&mut saga, op);
        }
        if saga.status == SagaStatus::CompensationCompleted {
            let forward_done: Vec<_> = saga
                .completed_steps
                .iter()
                .filter(|step| !step.is_compensation())
                .collect();
            prop_assert!(saga.completed_steps.contains(&SagaStep::CancelOrder));
            if forward_done.contains(&&SagaStep::ProcessPayment) {
                prop_assert!(saga.completed_steps.contains(&SagaStep::CancelPayment));
            }
        }
    }
}
