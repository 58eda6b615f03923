//! HTTP API server for the saga orchestrator.
//!
//! Exposes saga start, query and cancellation endpoints, an inbound event
//! endpoint feeding the partitioned dispatcher, health and Prometheus
//! metrics. [`Runtime`] owns the long-lived tasks behind the server.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use lock::DistributedLock;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::messaging::DEFAULT_PARTITION_CAPACITY;
use saga::{
    MaintenanceJob, MessagePublisher, PartitionedDispatcher, SagaOrchestrator, TimeoutSupervisor,
};
use saga_store::SagaStore;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use routes::sagas::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, L, P>(state: Arc<AppState<S, L, P>>, metrics_handle: PrometheusHandle) -> Router
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/api/sagas", post(routes::sagas::start::<S, L, P>))
        .route("/api/sagas/active", get(routes::sagas::active::<S, L, P>))
        .route("/api/sagas/health", get(routes::sagas::health::<S, L, P>))
        .route(
            "/api/sagas/order/{order_id}",
            get(routes::sagas::by_order::<S, L, P>),
        )
        .route(
            "/api/sagas/user/{user_id}",
            get(routes::sagas::by_user::<S, L, P>),
        )
        .route("/api/sagas/{saga_id}", get(routes::sagas::get::<S, L, P>))
        .route(
            "/api/sagas/{saga_id}/cancel",
            post(routes::sagas::cancel::<S, L, P>),
        )
        .route("/api/events", post(routes::events::publish::<S, L, P>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// The orchestrator's background tasks and the state handed to the router.
pub struct Runtime<S, L, P> {
    pub state: Arc<AppState<S, L, P>>,
    supervisor_task: JoinHandle<()>,
    maintenance_task: JoinHandle<()>,
    maintenance_shutdown: Arc<Notify>,
}

impl<S, L, P> Runtime<S, L, P>
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    /// Starts the dispatcher, the timeout supervisor and the maintenance job.
    pub fn start(orchestrator: SagaOrchestrator<S, L, P>) -> Self {
        let config = orchestrator.config().clone();

        let dispatcher = Arc::new(PartitionedDispatcher::start(
            Arc::new(orchestrator.clone()),
            config.worker_partitions,
            DEFAULT_PARTITION_CAPACITY,
        ));

        let supervisor = TimeoutSupervisor::new(orchestrator.clone(), config.timeout_check_interval);
        let supervisor_handle = supervisor.handle();
        let supervisor_task = supervisor.start();

        let maintenance =
            MaintenanceJob::new(orchestrator.clone()).with_supervisor(supervisor_handle.clone());
        let maintenance_shutdown = maintenance.shutdown_signal();
        let maintenance_task = maintenance.start();

        let state = Arc::new(AppState {
            orchestrator,
            dispatcher,
            supervisor: supervisor_handle,
        });

        Self {
            state,
            supervisor_task,
            maintenance_task,
            maintenance_shutdown,
        }
    }

    /// Stops the background tasks and releases every lock this process holds.
    ///
    /// Locks are released only after every task that takes them has stopped.
    pub async fn shutdown(self, grace: Duration) {
        // 1. Stop the timeout supervisor
        self.state.supervisor.stop();
        if tokio::time::timeout(grace, self.supervisor_task).await.is_err() {
            tracing::warn!("timeout supervisor did not stop in time");
        }

        // 2. Stop the maintenance job
        self.maintenance_shutdown.notify_one();
        if tokio::time::timeout(grace, self.maintenance_task).await.is_err() {
            tracing::warn!("maintenance job did not stop in time");
        }

        // 3. Drain queued inbound messages
        if tokio::time::timeout(grace, self.state.dispatcher.shutdown())
            .await
            .is_err()
        {
            tracing::warn!("dispatcher did not drain in time");
        }

        // 4. Release held locks
        match self.state.orchestrator.release_held_locks().await {
            Ok(released) => tracing::info!(released, "released held locks"),
            Err(e) => tracing::error!(error = %e, "failed to release held locks"),
        }
    }
}
