//! Inbound message injection.
//!
//! Stands in for the broker consumer: an envelope posted here takes the
//! same path through the partitioned dispatcher as one read off a topic.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use lock::DistributedLock;
use saga::{MessageEnvelope, MessagePublisher, SAGA_TIMEOUT_CHECK};
use saga_store::SagaStore;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::sagas::AppState;

#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    pub envelope: MessageEnvelope,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub success: bool,
    pub topic: String,
    pub partition: usize,
}

/// POST /api/events: queue an envelope for the orchestrator.
///
/// Answers 202 once the envelope is queued; the outcome is visible on the
/// saga. Envelopes without a type, or without a sagaId where one is
/// needed, are refused up front.
#[tracing::instrument(skip(state, message))]
pub async fn publish<S, L, P>(
    State(state): State<Arc<AppState<S, L, P>>>,
    Json(message): Json<InboundMessage>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError>
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    let InboundMessage { topic, envelope } = message;
    let topics = &state.orchestrator.config().topics;

    if topic.trim().is_empty() {
        return Err(ApiError::BadRequest("topic is required".to_string()));
    }
    if topic != topics.dead_letter {
        let message_type = envelope.require_type()?;
        let sweep_request = topic == topics.saga_events && message_type == SAGA_TIMEOUT_CHECK;
        if !sweep_request {
            envelope.require_saga_id()?;
        }
    }

    let key = envelope
        .saga_id
        .as_ref()
        .map(|id| id.as_str())
        .unwrap_or_default();
    let partition = saga::messaging::partition_for(key, state.dispatcher.partitions());

    state.dispatcher.dispatch(topic.clone(), envelope).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            success: true,
            topic,
            partition,
        }),
    ))
}
