//! Low-frequency housekeeping: ledger eviction, terminal saga purge and
//! a periodic summary log.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lock::DistributedLock;
use saga_store::SagaStore;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::messaging::MessagePublisher;
use crate::orchestrator::SagaOrchestrator;
use crate::supervisor::SupervisorHandle;

/// Per-saga monitor entries older than this are dropped on each tick.
const MONITOR_ENTRY_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// What one maintenance tick removed.
///
/// A count is `None` when that part of the tick failed; the failure is
/// logged and the rest of the tick still runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub ledger_evicted: Option<u64>,
    pub sagas_purged: Option<u64>,
    pub locks_purged: Option<u64>,
    pub monitor_entries_pruned: usize,
}

/// Background task running housekeeping on a fixed interval.
pub struct MaintenanceJob<S, L, P> {
    orchestrator: SagaOrchestrator<S, L, P>,
    supervisor: Option<SupervisorHandle>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

fn cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl<S, L, P> MaintenanceJob<S, L, P>
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    pub fn new(orchestrator: SagaOrchestrator<S, L, P>) -> Self {
        let interval = orchestrator.config().maintenance_interval;
        Self {
            orchestrator,
            supervisor: None,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Includes the supervisor's counters in the summary log.
    pub fn with_supervisor(mut self, supervisor: SupervisorHandle) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Returns the signal that stops the loop started by [`Self::start`].
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Runs one maintenance pass.
    pub async fn run_once(&self) -> MaintenanceReport {
        let now = Utc::now();
        let config = self.orchestrator.config();
        let store = self.orchestrator.store();
        let mut report = MaintenanceReport::default();

        match store
            .evict_older_than(cutoff(now, config.ledger_retention))
            .await
        {
            Ok(evicted) => report.ledger_evicted = Some(evicted),
            Err(e) => tracing::error!(error = %e, "ledger eviction failed"),
        }

        match store
            .purge_terminal_before(cutoff(now, config.saga_retention))
            .await
        {
            Ok(purged) => report.sagas_purged = Some(purged),
            Err(e) => tracing::error!(error = %e, "terminal saga purge failed"),
        }

        match self.orchestrator.lock().purge_expired().await {
            Ok(purged) => report.locks_purged = Some(purged),
            Err(e) => tracing::warn!(error = %e, "expired lock purge failed"),
        }

        report.monitor_entries_pruned = self
            .orchestrator
            .monitor()
            .prune_stale(MONITOR_ENTRY_MAX_AGE);

        match store.count_by_status().await {
            Ok(counts) => {
                let mut counts: Vec<_> = counts
                    .into_iter()
                    .map(|(status, count)| format!("{status}={count}"))
                    .collect();
                counts.sort();
                tracing::info!(counts = %counts.join(" "), "saga counts by status");
            }
            Err(e) => tracing::warn!(error = %e, "saga count query failed"),
        }

        let (checks, timeouts) = self
            .supervisor
            .as_ref()
            .map(|s| (s.total_checks(), s.total_timeouts()))
            .unwrap_or_default();
        tracing::info!(
            "maintenance finished: {checks} timeout checks, {timeouts} timed out, {} purged",
            report.sagas_purged.unwrap_or(0)
        );
        tracing::debug!(?report, "maintenance report");

        report
    }

    /// Spawns the maintenance loop.
    ///
    /// The first pass runs one interval after start.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.interval.max(Duration::from_millis(1));
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let shutdown = self.shutdown.clone();

            tracing::info!(interval_secs = period.as_secs(), "maintenance job started");

            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = interval.tick() => {
                        self.run_once().await;
                    }
                }
            }

            tracing::info!("maintenance job stopped");
        })
    }
}
