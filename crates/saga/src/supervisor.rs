//! Periodic timeout sweeps and retry backoff.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lock::DistributedLock;
use rand::Rng;
use saga_store::SagaStore;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::messaging::MessagePublisher;
use crate::orchestrator::{SagaOrchestrator, TimeoutSweep};

/// Largest fraction a retry delay is moved by jitter, either way.
pub const MAX_JITTER: f64 = 0.2;

/// Delay before retry number `retry` (1-based).
///
/// `base * 2^(retry - 1)`, scaled by `1 + jitter` and capped at `max`.
/// `jitter` is clamped to `[-MAX_JITTER, MAX_JITTER]`.
pub fn retry_delay(base: Duration, max: Duration, retry: u32, jitter: f64) -> Duration {
    let exponent = retry.saturating_sub(1).min(31) as i32;
    let raw = base.as_secs_f64() * 2f64.powi(exponent);
    let jittered = raw * (1.0 + jitter.clamp(-MAX_JITTER, MAX_JITTER));
    Duration::from_secs_f64(jittered.clamp(0.0, max.as_secs_f64()))
}

/// [`retry_delay`] with random jitter.
pub fn jittered_retry_delay(base: Duration, max: Duration, retry: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(-MAX_JITTER..=MAX_JITTER);
    retry_delay(base, max, retry, jitter)
}

/// Liveness of the timeout supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerHealth {
    pub healthy: bool,
    pub total_checks: u64,
    pub total_timeouts: u64,
    pub last_check_time: Option<DateTime<Utc>>,
    /// Seconds since the last successful check.
    pub since_last_check: Option<i64>,
}

#[derive(Debug)]
struct SupervisorStats {
    started_at: DateTime<Utc>,
    total_checks: u64,
    total_timeouts: u64,
    last_check_time: Option<DateTime<Utc>>,
}

/// Handle for stopping a supervisor and reading its counters.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    shutdown: Arc<Notify>,
    stats: Arc<Mutex<SupervisorStats>>,
    interval: Duration,
}

impl SupervisorHandle {
    fn stats(&self) -> MutexGuard<'_, SupervisorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks the supervisor loop to exit after its current tick.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    pub fn total_checks(&self) -> u64 {
        self.stats().total_checks
    }

    pub fn total_timeouts(&self) -> u64 {
        self.stats().total_timeouts
    }

    /// Unhealthy once no check has succeeded for four intervals.
    pub fn health(&self) -> SchedulerHealth {
        let now = Utc::now();
        let stats = self.stats();
        let reference = stats.last_check_time.unwrap_or(stats.started_at);
        let allowed = chrono::Duration::from_std(self.interval * 4).unwrap_or(chrono::Duration::MAX);

        SchedulerHealth {
            healthy: now - reference <= allowed,
            total_checks: stats.total_checks,
            total_timeouts: stats.total_timeouts,
            last_check_time: stats.last_check_time,
            since_last_check: stats
                .last_check_time
                .map(|last| (now - last).num_seconds()),
        }
    }

    fn record(&self, sweep: &TimeoutSweep) {
        let mut stats = self.stats();
        stats.total_checks += 1;
        stats.total_timeouts += sweep.timed_out() as u64;
        stats.last_check_time = Some(Utc::now());
    }
}

/// Background task running [`SagaOrchestrator::check_for_timeouts`] on a
/// fixed interval.
pub struct TimeoutSupervisor<S, L, P> {
    orchestrator: SagaOrchestrator<S, L, P>,
    handle: SupervisorHandle,
}

impl<S, L, P> TimeoutSupervisor<S, L, P>
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    pub fn new(orchestrator: SagaOrchestrator<S, L, P>, interval: Duration) -> Self {
        Self {
            orchestrator,
            handle: SupervisorHandle {
                shutdown: Arc::new(Notify::new()),
                stats: Arc::new(Mutex::new(SupervisorStats {
                    started_at: Utc::now(),
                    total_checks: 0,
                    total_timeouts: 0,
                    last_check_time: None,
                })),
                interval,
            },
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Runs one sweep and updates the counters on success.
    pub async fn run_once(&self) -> Result<TimeoutSweep> {
        let sweep = self.orchestrator.check_for_timeouts().await?;
        self.handle.record(&sweep);
        Ok(sweep)
    }

    /// Spawns the supervisor loop.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.handle.interval.max(Duration::from_millis(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let shutdown = self.handle.shutdown.clone();

            tracing::info!(
                interval_secs = self.handle.interval.as_secs(),
                "timeout supervisor started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::error!(error = %e, "timeout sweep failed");
                        }
                    }
                }
            }

            tracing::info!("timeout supervisor stopped");
        })
    }
}
