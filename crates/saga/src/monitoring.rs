//! Passive saga counters and the health snapshot.
//!
//! The orchestrator reports every transition point here. Each call both
//! updates the in-process tallies behind [`HealthSnapshot`] and emits the
//! matching series through the `metrics` facade.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::SagaId;
use domain::SagaStep;
use serde::Serialize;

use crate::config::SagaConfig;

/// Point-in-time health of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub active_count: u64,
    /// Sagas that reached a terminal status.
    pub total_processed: u64,
    /// Sagas that ended compensated or with failed compensation.
    pub total_failures: u64,
    pub failure_rate: f64,
    pub tracked_sagas: usize,
}

/// Per-saga tallies kept while a saga is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaMetrics {
    pub message_count: u64,
    pub failure_count: u64,
    pub started_at: DateTime<Utc>,
}

impl SagaMetrics {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            message_count: 0,
            failure_count: 0,
            started_at,
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    tracked: HashMap<SagaId, SagaMetrics>,
    active_count: u64,
    total_processed: u64,
    total_failures: u64,
    total_messages: u64,
}

/// Shared saga monitor. Clones observe the same counters.
#[derive(Debug, Clone)]
pub struct SagaMonitor {
    state: Arc<Mutex<MonitorState>>,
    max_active: u64,
    failure_rate_threshold: f64,
}

impl SagaMonitor {
    pub fn new(max_active: u64, failure_rate_threshold: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MonitorState::default())),
            max_active,
            failure_rate_threshold,
        }
    }

    pub fn from_config(config: &SagaConfig) -> Self {
        Self::new(config.max_active_sagas, config.failure_rate_threshold)
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_saga_started(&self, saga_id: &SagaId) {
        let mut state = self.state();
        state
            .tracked
            .insert(saga_id.clone(), SagaMetrics::new(Utc::now()));
        state.active_count += 1;

        metrics::counter!("saga_started_total").increment(1);
        metrics::gauge!("saga_active").set(state.active_count as f64);
    }

    pub fn record_saga_completed(&self, saga_id: &SagaId, duration: Duration) {
        let mut state = self.state();
        Self::finish(&mut state, saga_id);
        state.total_processed += 1;

        metrics::counter!("saga_completed_total").increment(1);
        metrics::histogram!("saga_duration_seconds").record(duration.as_secs_f64());
        metrics::gauge!("saga_active").set(state.active_count as f64);
    }

    pub fn record_saga_failed(&self, saga_id: &SagaId, reason: &str) {
        let mut state = self.state();
        Self::finish(&mut state, saga_id);
        state.total_processed += 1;
        state.total_failures += 1;

        metrics::counter!("saga_failed_total").increment(1);
        metrics::gauge!("saga_active").set(state.active_count as f64);
        tracing::warn!(saga_id = %saga_id, reason, "saga failed");
    }

    fn finish(state: &mut MonitorState, saga_id: &SagaId) {
        if state.tracked.remove(saga_id).is_some() {
            state.active_count = state.active_count.saturating_sub(1);
        } else {
            tracing::debug!(saga_id = %saga_id, "terminal saga was not tracked");
        }
    }

    pub fn record_message_processed(&self, saga_id: &SagaId, message_type: &str) {
        let mut state = self.state();
        state.total_messages += 1;
        if let Some(metrics) = state.tracked.get_mut(saga_id) {
            metrics.message_count += 1;
        }
        metrics::counter!("saga_messages_processed_total", "type" => message_type.to_string())
            .increment(1);
    }

    pub fn record_message_failed(&self, saga_id: &SagaId, message_type: &str) {
        let mut state = self.state();
        if let Some(metrics) = state.tracked.get_mut(saga_id) {
            metrics.failure_count += 1;
        }
        metrics::counter!("saga_messages_failed_total", "type" => message_type.to_string())
            .increment(1);
    }

    pub fn record_step_duration(&self, step: SagaStep, duration: Duration) {
        metrics::histogram!("saga_step_duration_seconds", "step" => step.as_str())
            .record(duration.as_secs_f64());
    }

    pub fn record_timeout(&self) {
        metrics::counter!("saga_timeouts_total").increment(1);
    }

    pub fn record_dead_letter(&self, topic: &str) {
        metrics::counter!("saga_dlq_messages_total", "topic" => topic.to_string()).increment(1);
    }

    /// Total inbound messages applied since start or the last reset.
    pub fn total_messages(&self) -> u64 {
        self.state().total_messages
    }

    /// Current health.
    ///
    /// Unhealthy when the active count exceeds the ceiling or the failure
    /// rate exceeds the threshold.
    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state();
        let failure_rate = if state.total_processed > 0 {
            state.total_failures as f64 / state.total_processed as f64
        } else {
            0.0
        };

        HealthSnapshot {
            healthy: state.active_count <= self.max_active
                && failure_rate <= self.failure_rate_threshold,
            active_count: state.active_count,
            total_processed: state.total_processed,
            total_failures: state.total_failures,
            failure_rate,
            tracked_sagas: state.tracked.len(),
        }
    }

    pub fn saga_metrics(&self, saga_id: &SagaId) -> Option<SagaMetrics> {
        self.state().tracked.get(saga_id).cloned()
    }

    /// Drops per-saga entries started more than `max_age` ago.
    ///
    /// Pruned sagas stop counting as active; the gauge follows.
    pub fn prune_stale(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut state = self.state();
        let before = state.tracked.len();
        state.tracked.retain(|_, metrics| metrics.started_at >= cutoff);
        let pruned = before - state.tracked.len();
        if pruned > 0 {
            state.active_count = state.active_count.saturating_sub(pruned as u64);
            metrics::gauge!("saga_active").set(state.active_count as f64);
        }
        pruned
    }

    pub fn reset(&self) {
        *self.state() = MonitorState::default();
        metrics::gauge!("saga_active").set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_counts() {
        let monitor = SagaMonitor::new(1000, 0.10);
        let a = SagaId::new("a");
        let b = SagaId::new("b");

        monitor.record_saga_started(&a);
        monitor.record_saga_started(&b);
        monitor.record_message_processed(&a, "PAYMENT_PROCESSED");
        monitor.record_message_failed(&a, "PAYMENT_PROCESSED");

        let metrics = monitor.saga_metrics(&a).unwrap();
        assert_eq!(metrics.message_count, 1);
        assert_eq!(metrics.failure_count, 1);

        monitor.record_saga_completed(&a, Duration::from_secs(2));
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.active_count, 1);
        assert_eq!(snapshot.total_processed, 1);
        assert_eq!(snapshot.tracked_sagas, 1);
        assert!(snapshot.healthy);
        assert!(monitor.saga_metrics(&a).is_none());
        assert_eq!(monitor.total_messages(), 1);
    }

    #[test]
    fn test_failure_rate_marks_unhealthy() {
        let monitor = SagaMonitor::new(1000, 0.10);
        for i in 0..5 {
            let id = SagaId::new(format!("s-{i}"));
            monitor.record_saga_started(&id);
            monitor.record_saga_completed(&id, Duration::from_secs(1));
        }
        let failed = SagaId::new("f");
        monitor.record_saga_started(&failed);
        monitor.record_saga_failed(&failed, "declined");

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.total_processed, 6);
        assert_eq!(snapshot.total_failures, 1);
        assert!((snapshot.failure_rate - 1.0 / 6.0).abs() < f64::EPSILON);
        assert!(!snapshot.healthy);
    }

    #[test]
    fn test_active_ceiling_marks_unhealthy() {
        let monitor = SagaMonitor::new(2, 0.10);
        for i in 0..3 {
            monitor.record_saga_started(&SagaId::new(format!("s-{i}")));
        }
        assert!(!monitor.snapshot().healthy);
    }

    #[test]
    fn test_pruned_saga_no_longer_counts_as_active() {
        let monitor = SagaMonitor::new(1000, 0.10);
        let id = SagaId::new("long-running");
        monitor.record_saga_started(&id);
        {
            let mut state = monitor.state();
            if let Some(metrics) = state.tracked.get_mut(&id) {
                metrics.started_at = Utc::now() - chrono::Duration::hours(2);
            }
        }

        monitor.prune_stale(Duration::from_secs(3600));
        monitor.record_saga_completed(&id, Duration::from_secs(7200));

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.active_count, 0);
        assert_eq!(snapshot.tracked_sagas, 0);
        assert_eq!(snapshot.total_processed, 1);
    }

    #[test]
    fn test_prune_and_reset() {
        let monitor = SagaMonitor::new(1000, 0.10);
        monitor.record_saga_started(&SagaId::new("old"));
        {
            let mut state = monitor.state();
            if let Some(metrics) = state.tracked.get_mut(&SagaId::new("old")) {
                metrics.started_at = Utc::now() - chrono::Duration::hours(2);
            }
        }
        monitor.record_saga_started(&SagaId::new("new"));

        assert_eq!(monitor.prune_stale(Duration::from_secs(3600)), 1);
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.tracked_sagas, 1);
        assert_eq!(snapshot.active_count, 1);

        // a pruned saga finishing later must not leave a phantom active count
        monitor.record_saga_completed(&SagaId::new("old"), Duration::from_secs(7200));
        assert_eq!(monitor.snapshot().active_count, 1);
        monitor.record_saga_completed(&SagaId::new("new"), Duration::from_secs(1));
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.active_count, 0);
        assert_eq!(snapshot.total_processed, 2);

        monitor.reset();
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.active_count, 0);
        assert_eq!(snapshot.tracked_sagas, 0);
    }
}
