//! API server entry point.

use std::sync::Arc;
use std::time::Duration;

use api::Runtime;
use api::config::{Config, LogFormat};
use lock::{DistributedLock, InMemoryLock, PostgresLock};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{InMemoryBus, MessagePublisher, SagaOrchestrator};
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Time each background task gets to stop before it is abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Runs the server until a shutdown signal, then stops the background
/// tasks before the HTTP server drains.
async fn serve<S, L, P>(
    config: &Config,
    orchestrator: SagaOrchestrator<S, L, P>,
    metrics_handle: PrometheusHandle,
) where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    let runtime = Runtime::start(orchestrator);
    let app = api::create_app(runtime.state.clone(), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            runtime.shutdown(SHUTDOWN_GRACE).await;
        })
        .await
        .expect("server error");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    api::routes::metrics::describe();

    // 3. Pick the store and lock backends, then serve
    let bus = Arc::new(InMemoryBus::new());
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to PostgreSQL");

            let store = PostgresSagaStore::new(pool.clone());
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL saga store and lock");

            let orchestrator = SagaOrchestrator::new(
                Arc::new(store),
                Arc::new(PostgresLock::new(pool)),
                bus,
                config.saga.clone(),
            );
            serve(&config, orchestrator, metrics_handle).await;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory saga store and lock");
            let orchestrator = SagaOrchestrator::new(
                Arc::new(InMemorySagaStore::new()),
                Arc::new(InMemoryLock::new()),
                bus,
                config.saga.clone(),
            );
            serve(&config, orchestrator, metrics_handle).await;
        }
    }

    tracing::info!("server shut down gracefully");
}
