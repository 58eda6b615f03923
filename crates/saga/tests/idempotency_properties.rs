//! Property tests for reply handling: redelivery and arbitrary replies.

use std::sync::Arc;
use std::time::Duration;

use common::{MessageId, Money, SagaId};
use domain::{AuditKind, EventType, NewSaga, SagaState, SagaStatus, SagaStep};
use lock::InMemoryLock;
use proptest::prelude::*;
use saga::{InMemoryBus, MessageEnvelope, SagaConfig, SagaOrchestrator};
use saga_store::InMemorySagaStore;

type TestOrchestrator = SagaOrchestrator<InMemorySagaStore, InMemoryLock, InMemoryBus>;

fn orchestrator() -> TestOrchestrator {
    SagaOrchestrator::new(
        Arc::new(InMemorySagaStore::new()),
        Arc::new(InMemoryLock::new()),
        Arc::new(InMemoryBus::new()),
        SagaConfig {
            retry_base_delay: Duration::ZERO,
            ..SagaConfig::default()
        },
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn start(orchestrator: &TestOrchestrator) -> SagaId {
    orchestrator
        .start(NewSaga {
            order_id: 42,
            user_id: "user".to_string(),
            user_email: "user@example.com".to_string(),
            user_name: "User".to_string(),
            description: "order".to_string(),
            total_amount: Money::from_cents(5000),
        })
        .await
        .unwrap()
        .saga_id
}

/// A reply drawn from the whole vocabulary, addressed to any step, with or
/// without a message id.
fn any_reply() -> impl Strategy<Value = (i32, EventType, bool)> {
    let steps = prop::sample::select(vec![1, 2, 3, 101, 102]);
    let events = prop::sample::select(EventType::ALL.to_vec());
    (steps, events, any::<bool>())
}

fn envelope(
    saga_id: &SagaId,
    (step_id, event, with_id): (i32, EventType, bool),
    n: usize,
) -> MessageEnvelope {
    let envelope = MessageEnvelope::new(event.as_str(), serde_json::json!({}))
        .with_saga(saga_id.clone())
        .with_step(step_id);
    if with_id {
        envelope.with_message_id(MessageId::new(format!("MSG-prop-{n}")))
    } else {
        envelope
    }
}

/// The parts of a saga that replies may change.
#[derive(Debug, PartialEq)]
struct Fingerprint {
    status: SagaStatus,
    current_step: SagaStep,
    completed_steps: Vec<SagaStep>,
    retry_count: u32,
    compensation_retry_count: u32,
    failure_reason: Option<String>,
    audit: Vec<AuditKind>,
}

fn fingerprint(saga: &SagaState) -> Fingerprint {
    Fingerprint {
        status: saga.status,
        current_step: saga.current_step,
        completed_steps: saga.completed_steps.clone(),
        retry_count: saga.retry_count,
        compensation_retry_count: saga.compensation_retry_count,
        failure_reason: saga.failure_reason.clone(),
        audit: saga.events.iter().map(|e| e.kind).collect(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn redelivery_changes_nothing(
        replies in prop::collection::vec(any_reply(), 1..12),
        copies in 2usize..4,
    ) {
        let rt = runtime();
        let (once, repeated) = rt.block_on(async {
            let single = orchestrator();
            let single_id = start(&single).await;
            let doubled = orchestrator();
            let doubled_id = start(&doubled).await;

            for (n, reply) in replies.iter().enumerate() {
                single
                    .handle_event(envelope(&single_id, *reply, n))
                    .await
                    .unwrap();
                for _ in 0..copies {
                    doubled
                        .handle_event(envelope(&doubled_id, *reply, n))
                        .await
                        .unwrap();
                }
            }

            (
                single.get_saga(&single_id).await.unwrap(),
                doubled.get_saga(&doubled_id).await.unwrap(),
            )
        });

        prop_assert_eq!(fingerprint(&once), fingerprint(&repeated));
        prop_assert_eq!(once.version, repeated.version);
    }

    #[test]
    fn forward_steps_are_never_skipped(
        replies in prop::collection::vec(any_reply(), 1..20),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let orchestrator = orchestrator();
            let saga_id = start(&orchestrator).await;
            let mut terminal: Option<SagaState> = None;

            for (n, reply) in replies.iter().enumerate() {
                orchestrator
                    .handle_event(envelope(&saga_id, *reply, n))
                    .await
                    .unwrap();
                let saga = orchestrator.get_saga(&saga_id).await.unwrap();

                let forward: Vec<SagaStep> = saga
                    .completed_steps
                    .iter()
                    .copied()
                    .filter(|step| !step.is_compensation())
                    .collect();
                assert_eq!(forward.as_slice(), &SagaStep::FORWARD[..forward.len()]);

                if let Some(before) = &terminal {
                    assert_eq!(saga.status, before.status);
                    assert_eq!(saga.current_step, before.current_step);
                } else if saga.is_terminal() {
                    terminal = Some(saga);
                }
            }
        });
    }
}
