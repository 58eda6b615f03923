//! Saga start, query and cancellation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{Money, SagaId};
use domain::{NewSaga, SagaState};
use lock::DistributedLock;
use saga::{
    HealthSnapshot, MessagePublisher, PartitionedDispatcher, SagaOrchestrator, SchedulerHealth,
    SupervisorHandle,
};
use saga_store::SagaStore;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S, L, P> {
    pub orchestrator: SagaOrchestrator<S, L, P>,
    pub dispatcher: Arc<PartitionedDispatcher>,
    pub supervisor: SupervisorHandle,
}

// -- Request types --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSagaRequest {
    pub user_id: String,
    pub order_id: i64,
    #[serde(default)]
    pub user_email: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub description: String,
    pub total_amount_cents: i64,
}

impl StartSagaRequest {
    fn into_new_saga(self) -> Result<NewSaga, ApiError> {
        if self.user_id.trim().is_empty() {
            return Err(ApiError::BadRequest("userId is required".to_string()));
        }
        if self.total_amount_cents < 0 {
            return Err(ApiError::BadRequest(format!(
                "totalAmountCents must not be negative, got {}",
                self.total_amount_cents
            )));
        }

        Ok(NewSaga {
            order_id: self.order_id,
            user_id: self.user_id,
            user_email: self.user_email,
            user_name: self.user_name,
            description: self.description,
            total_amount: Money::from_cents(self.total_amount_cents),
        })
    }
}

// -- Response types --

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaResponse {
    pub success: bool,
    pub saga: SagaState,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedResponse {
    pub success: bool,
    pub saga_id: SagaId,
    pub saga: SagaState,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaListResponse {
    pub success: bool,
    pub count: usize,
    pub sagas: Vec<SagaState>,
}

impl From<Vec<SagaState>> for SagaListResponse {
    fn from(sagas: Vec<SagaState>) -> Self {
        Self {
            success: true,
            count: sagas.len(),
            sagas,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaHealthResponse {
    pub success: bool,
    pub healthy: bool,
    pub orchestrator: HealthSnapshot,
    pub scheduler: SchedulerHealth,
}

// -- Handlers --

/// POST /api/sagas: start the purchase saga for an order.
///
/// Starting again for an order that already has a saga returns that saga.
#[tracing::instrument(skip(state, req))]
pub async fn start<S, L, P>(
    State(state): State<Arc<AppState<S, L, P>>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<StartedResponse>), ApiError>
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    let saga = state.orchestrator.start(req.into_new_saga()?).await?;

    Ok((
        StatusCode::CREATED,
        Json(StartedResponse {
            success: true,
            saga_id: saga.saga_id.clone(),
            saga,
        }),
    ))
}

/// GET /api/sagas/{saga_id}
pub async fn get<S, L, P>(
    State(state): State<Arc<AppState<S, L, P>>>,
    Path(saga_id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError>
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    let saga = state.orchestrator.get_saga(&SagaId::new(saga_id)).await?;
    Ok(Json(SagaResponse {
        success: true,
        saga,
    }))
}

/// GET /api/sagas/order/{order_id}
pub async fn by_order<S, L, P>(
    State(state): State<Arc<AppState<S, L, P>>>,
    Path(order_id): Path<i64>,
) -> Result<Json<SagaListResponse>, ApiError>
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    let sagas = state.orchestrator.sagas_for_order(order_id).await?;
    if sagas.is_empty() {
        return Err(ApiError::NotFound(format!("No saga for order {order_id}")));
    }
    Ok(Json(sagas.into()))
}

/// GET /api/sagas/user/{user_id}
pub async fn by_user<S, L, P>(
    State(state): State<Arc<AppState<S, L, P>>>,
    Path(user_id): Path<String>,
) -> Result<Json<SagaListResponse>, ApiError>
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    let sagas = state.orchestrator.find_by_user(&user_id).await?;
    Ok(Json(sagas.into()))
}

/// GET /api/sagas/active
pub async fn active<S, L, P>(
    State(state): State<Arc<AppState<S, L, P>>>,
) -> Result<Json<SagaListResponse>, ApiError>
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    let sagas = state.orchestrator.active_sagas().await?;
    Ok(Json(sagas.into()))
}

/// POST /api/sagas/{saga_id}/cancel
#[tracing::instrument(skip(state))]
pub async fn cancel<S, L, P>(
    State(state): State<Arc<AppState<S, L, P>>>,
    Path(saga_id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError>
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    let saga = state
        .orchestrator
        .cancel_by_user(&SagaId::new(saga_id))
        .await?;
    Ok(Json(SagaResponse {
        success: true,
        saga,
    }))
}

/// GET /api/sagas/health: orchestrator counters and supervisor liveness.
///
/// Answers 503 when either side reports unhealthy.
pub async fn health<S, L, P>(
    State(state): State<Arc<AppState<S, L, P>>>,
) -> (StatusCode, Json<SagaHealthResponse>)
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    let orchestrator = state.orchestrator.health();
    let scheduler = state.supervisor.health();
    let healthy = orchestrator.healthy && scheduler.healthy;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(SagaHealthResponse {
            success: true,
            healthy,
            orchestrator,
            scheduler,
        }),
    )
}
