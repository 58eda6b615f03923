//! Prometheus metrics endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::Unit;
use metrics_exporter_prometheus::PrometheusHandle;

/// Registers help text for the orchestrator's metrics.
///
/// Call once after installing the recorder.
pub fn describe() {
    metrics::describe_counter!("saga_started_total", "Sagas started");
    metrics::describe_counter!("saga_completed_total", "Sagas that ran every forward step");
    metrics::describe_counter!(
        "saga_failed_total",
        "Sagas that ended compensated or with failed compensation"
    );
    metrics::describe_counter!(
        "saga_messages_processed_total",
        "Reply events applied, by message type"
    );
    metrics::describe_counter!(
        "saga_messages_failed_total",
        "Reply events that could not be handled, by message type"
    );
    metrics::describe_counter!("saga_timeouts_total", "Steps that passed their deadline");
    metrics::describe_counter!(
        "saga_dlq_messages_total",
        "Messages received on the dead-letter channel"
    );
    metrics::describe_gauge!("saga_active", "Sagas currently in flight");
    metrics::describe_histogram!(
        "saga_step_duration_seconds",
        Unit::Seconds,
        "Time from step start to its reply"
    );
    metrics::describe_histogram!(
        "saga_duration_seconds",
        Unit::Seconds,
        "Time from saga start to completion"
    );
}

/// GET /metrics: returns Prometheus-formatted metrics.
pub async fn get(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}
