//! The saga state machine.
//!
//! [`SagaOrchestrator`] owns every mutation of a saga. Inbound replies go
//! through [`SagaOrchestrator::handle_event`], which checks the idempotency
//! ledger, drops stale replies, applies the reply to the saga and commits
//! the new state together with the ledger row. Outbound commands are
//! published after the commit, under the order's entity lock so each
//! command carries a fencing token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SagaId;
use domain::{
    AuditKind, Capability, CommandType, CompensationOutcome, EventType, LedgerKey, NewSaga,
    ProcessedMessage, SagaState, SagaStatus, SagaStep,
};
use lock::{DistributedLock, order_lock_key, payment_lock_key, saga_lock_key};
use saga_store::{SagaStore, SagaStoreExt, StoreError};
use serde::Serialize;
use serde_json::{Value, json};

use crate::commands::build_command;
use crate::config::SagaConfig;
use crate::error::{Result, SagaError};
use crate::messaging::{MessageEnvelope, MessageHandler, MessagePublisher, payload_text};
use crate::monitoring::{HealthSnapshot, SagaMonitor};
use crate::supervisor::jittered_retry_delay;

/// Saga-events envelope type that triggers an immediate timeout sweep.
pub const SAGA_TIMEOUT_CHECK: &str = "SAGA_TIMEOUT_CHECK";

/// Saga-events envelope type that cancels the saga it names.
pub const SAGA_EXTERNAL_CANCEL_REQUEST: &str = "SAGA_EXTERNAL_CANCEL_REQUEST";

/// Lease taken on a saga while the timeout path acts on it.
const SAGA_LOCK_TTL: Duration = Duration::from_secs(30);

const DEFAULT_FAILURE_REASON: &str = "step failed";

/// What [`SagaOrchestrator::handle_event`] did with a reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventOutcome {
    /// The reply moved the saga forward, into compensation, or to an end.
    #[serde(rename_all = "camelCase")]
    Applied {
        status: SagaStatus,
        current_step: SagaStep,
    },
    /// The reply was already processed; `result` is what it produced then.
    Duplicate { result: Value },
    /// The reply answers a step the saga has already left.
    #[serde(rename_all = "camelCase")]
    Stale { current_step: SagaStep },
    /// No saga exists for the reply.
    Orphan,
}

/// Tally of one timeout sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimeoutSweep {
    pub examined: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl TimeoutSweep {
    /// Sagas the sweep acted on.
    pub fn timed_out(&self) -> usize {
        self.retried + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutAction {
    Retried,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Issued {
    Published,
    LockRefused,
}

/// Drives order purchase sagas.
///
/// Cloning is cheap; clones share the store, lock, publisher and monitor.
pub struct SagaOrchestrator<S, L, P> {
    store: Arc<S>,
    lock: Arc<L>,
    publisher: Arc<P>,
    monitor: SagaMonitor,
    config: Arc<SagaConfig>,
}

impl<S, L, P> Clone for SagaOrchestrator<S, L, P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            lock: self.lock.clone(),
            publisher: self.publisher.clone(),
            monitor: self.monitor.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, L, P> SagaOrchestrator<S, L, P>
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    pub fn new(store: Arc<S>, lock: Arc<L>, publisher: Arc<P>, config: SagaConfig) -> Self {
        let monitor = SagaMonitor::from_config(&config);
        Self {
            store,
            lock,
            publisher,
            monitor,
            config: Arc::new(config),
        }
    }

    /// Replaces the monitor, e.g. to share one between orchestrators.
    pub fn with_monitor(mut self, monitor: SagaMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn lock(&self) -> &Arc<L> {
        &self.lock
    }

    pub fn publisher(&self) -> &Arc<P> {
        &self.publisher
    }

    pub fn monitor(&self) -> &SagaMonitor {
        &self.monitor
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Starts a saga for an order and issues its first command.
    ///
    /// If the order already has a saga, that saga is returned and nothing
    /// is written or published.
    #[tracing::instrument(skip(self, new), fields(order_id = new.order_id))]
    pub async fn start(&self, new: NewSaga) -> Result<SagaState> {
        let order_id = new.order_id;
        if let Some(existing) = self.store.find_by_order_id(order_id).await?.into_iter().next() {
            tracing::info!(
                saga_id = %existing.saga_id,
                status = %existing.status,
                "saga already exists for order"
            );
            return Ok(existing);
        }

        let mut saga = SagaState::initiate(SagaId::generate(), new, self.config.retry_limits());
        saga.version = match self.store.insert(&saga).await {
            Ok(version) => version,
            Err(StoreError::DuplicateOrder { .. }) => {
                tracing::info!("lost saga creation race for order");
                return self.existing_for_order(order_id).await;
            }
            Err(e) => return Err(e.into()),
        };

        self.monitor.record_saga_started(&saga.saga_id);
        tracing::info!(saga_id = %saga.saga_id, "saga started");

        self.dispatch(saga).await
    }

    async fn existing_for_order(&self, order_id: i64) -> Result<SagaState> {
        if let Some(active) = self.store.find_active_by_order_id(order_id).await? {
            return Ok(active);
        }
        self.store
            .find_by_order_id(order_id)
            .await?
            .into_iter()
            .next()
            .ok_or(SagaError::OrderNotFound { order_id })
    }

    /// Persists `saga` and issues the command for its current step.
    ///
    /// A saga whose forward steps are all done is finished instead.
    pub async fn advance(&self, saga: SagaState) -> Result<SagaState> {
        let previous = saga.status;
        self.advance_with(saga, previous, None).await
    }

    async fn advance_with(
        &self,
        mut saga: SagaState,
        previous: SagaStatus,
        processed: Option<ProcessedMessage>,
    ) -> Result<SagaState> {
        if saga.current_step == SagaStep::Complete && !saga.is_terminal() {
            saga.finish()?;
        }

        let saga = self.store.save(saga, processed).await?;
        self.observe_terminal(&saga, previous);
        self.dispatch(saga).await
    }

    /// Publishes the current step's command while the saga is active.
    ///
    /// A refused entity lock fails the step, which may lead to another
    /// command (a retry or a compensation step), so this loops until a
    /// command goes out or the saga stops needing one.
    async fn dispatch(&self, mut saga: SagaState) -> Result<SagaState> {
        loop {
            if !saga.is_active() {
                return Ok(saga);
            }
            let Some(command) = saga.current_step.command() else {
                return Ok(saga);
            };

            match self.issue_command(&saga, command).await? {
                Issued::Published => return Ok(saga),
                Issued::LockRefused => {
                    let previous = saga.status;
                    let reason = format!("failed to acquire lock for step {}", saga.current_step);
                    self.apply_failure(&mut saga, &reason)?;
                    saga = self.store.save(saga, None).await?;
                    self.observe_terminal(&saga, previous);
                }
            }
        }
    }

    async fn issue_command(&self, saga: &SagaState, command: CommandType) -> Result<Issued> {
        let lock_key = match command.capability() {
            Capability::Payment => payment_lock_key(saga.order_id),
            Capability::Order => order_lock_key(saga.order_id),
        };
        let grant = self
            .lock
            .try_acquire(&lock_key, self.config.lock_ttl_for(command))
            .await?;
        let Some(token) = grant.fencing_token.filter(|_| grant.granted) else {
            tracing::warn!(
                saga_id = %saga.saga_id,
                step = %saga.current_step,
                lock_key = %lock_key,
                "entity lock refused"
            );
            return Ok(Issued::LockRefused);
        };

        let envelope = build_command(saga, command, token);
        let topic = self.config.topics.for_command(command);
        match self
            .publisher
            .publish(topic, saga.saga_id.as_str(), &envelope)
            .await
        {
            Ok(()) => tracing::info!(
                saga_id = %saga.saga_id,
                step = %saga.current_step,
                command = %command,
                topic,
                "command published"
            ),
            Err(e) => tracing::warn!(
                saga_id = %saga.saga_id,
                command = %command,
                error = %e,
                "command publish failed, timeout supervisor will retry"
            ),
        }

        if let Err(e) = self.lock.release(&lock_key, token).await {
            tracing::warn!(lock_key = %lock_key, error = %e, "entity lock release failed");
        }
        Ok(Issued::Published)
    }

    /// Applies a reply event to its saga.
    #[tracing::instrument(
        skip(self, envelope),
        fields(saga_id = ?envelope.saga_id, message_type = %envelope.message_type)
    )]
    pub async fn handle_event(&self, envelope: MessageEnvelope) -> Result<EventOutcome> {
        let saga_id = envelope.require_saga_id()?.clone();
        let message_type = envelope.require_type()?.to_string();
        let event: EventType = message_type
            .parse()
            .map_err(|_| SagaError::InvalidMessage(format!("unknown event type {message_type}")))?;

        // 1. Locate the saga
        let Some(mut saga) = self.store.find_by_id(&saga_id).await? else {
            tracing::debug!("ignoring event for unknown saga");
            return Ok(EventOutcome::Orphan);
        };

        // 2. Ledger check
        let step_id = envelope.step_id.unwrap_or_else(|| saga.current_step.number());
        let key = LedgerKey::new(
            saga_id.clone(),
            step_id,
            message_type.clone(),
            reply_attempt(&envelope, &saga),
        );
        if self
            .store
            .is_processed(envelope.message_id.as_ref(), &key)
            .await?
        {
            let result = self
                .store
                .processed_result(envelope.message_id.as_ref(), &key)
                .await?
                .unwrap_or(Value::Null);
            tracing::info!(step_id, "duplicate event skipped");
            return Ok(EventOutcome::Duplicate { result });
        }

        // 3. Stale check
        let step = saga.current_step;
        let answers_current_step = saga.is_active()
            && step_id == step.number()
            && (step.is_success_event(event) || step.is_failure_event(event));
        if !answers_current_step {
            tracing::info!(
                step_id,
                current_step = %step,
                status = %saga.status,
                "stale event ignored"
            );
            let record = ProcessedMessage::new(
                envelope.message_id.clone(),
                key,
                ledger_result("IGNORED_STALE", &saga),
            );
            self.store.record_processed(record).await?;
            return Ok(EventOutcome::Stale { current_step: step });
        }

        // 4. Apply
        let previous = saga.status;
        self.record_step_duration(&saga);
        let outcome = if step.is_success_event(event) {
            self.apply_success(&mut saga, &envelope.payload)?;
            "APPLIED"
        } else {
            let reason = payload_text(&envelope.payload, "errorMessage")
                .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string());
            self.monitor.record_message_failed(&saga_id, &message_type);
            self.apply_failure(&mut saga, &reason)?;
            "FAILURE_APPLIED"
        };
        self.monitor.record_message_processed(&saga_id, &message_type);

        let processed = ProcessedMessage::new(
            envelope.message_id.clone(),
            key,
            ledger_result(outcome, &saga),
        );
        let saga = self.advance_with(saga, previous, Some(processed)).await?;

        Ok(EventOutcome::Applied {
            status: saga.status,
            current_step: saga.current_step,
        })
    }

    /// Applies a success reply for the current step.
    pub fn on_step_success(&self, saga: &mut SagaState, payload: &Value) -> Result<()> {
        self.apply_success(saga, payload)
    }

    /// Applies a failure of the current step.
    pub fn on_step_failure(&self, saga: &mut SagaState, reason: &str) -> Result<()> {
        self.apply_failure(saga, reason)
    }

    fn apply_success(&self, saga: &mut SagaState, payload: &Value) -> Result<()> {
        if saga.is_compensating() {
            match saga.complete_compensation_step()? {
                Some(next) => tracing::info!(saga_id = %saga.saga_id, next = %next, "compensation continues"),
                None => tracing::info!(saga_id = %saga.saga_id, "compensation completed"),
            }
            return Ok(());
        }

        if saga.current_step == SagaStep::ProcessPayment
            && let Some(transaction_id) = payload_text(payload, "paymentTransactionId")
        {
            saga.payment_transaction_id = Some(transaction_id);
        }
        let next = saga.complete_forward_step()?;
        tracing::info!(saga_id = %saga.saga_id, next = %next, "step completed");
        Ok(())
    }

    fn apply_failure(&self, saga: &mut SagaState, reason: &str) -> Result<()> {
        if saga.is_compensating() {
            match saga.compensation_failed(reason)? {
                CompensationOutcome::Retry { attempt } => tracing::warn!(
                    saga_id = %saga.saga_id,
                    step = %saga.current_step,
                    attempt,
                    reason,
                    "compensation step failed, retrying"
                ),
                CompensationOutcome::Exhausted => tracing::error!(
                    saga_id = %saga.saga_id,
                    step = %saga.current_step,
                    reason,
                    "compensation failed, manual intervention required"
                ),
            }
            return Ok(());
        }

        saga.fail(reason)?;
        tracing::warn!(
            saga_id = %saga.saga_id,
            step = %saga.current_step,
            reason,
            "step failed"
        );
        match saga.begin_compensation()? {
            Some(first) => {
                tracing::info!(saga_id = %saga.saga_id, first = %first, "compensation started")
            }
            None => tracing::info!(saga_id = %saga.saga_id, "nothing to compensate"),
        }
        Ok(())
    }

    fn record_step_duration(&self, saga: &SagaState) {
        let elapsed = saga
            .time_in_current_step(Utc::now())
            .to_std()
            .unwrap_or_default();
        self.monitor.record_step_duration(saga.current_step, elapsed);
    }

    fn observe_terminal(&self, saga: &SagaState, previous: SagaStatus) {
        if previous.is_terminal() || !saga.is_terminal() {
            return;
        }
        if saga.status == SagaStatus::Completed {
            let duration = saga.duration(Utc::now()).to_std().unwrap_or_default();
            self.monitor.record_saga_completed(&saga.saga_id, duration);
            tracing::info!(saga_id = %saga.saga_id, "saga completed");
        } else {
            let reason = saga.failure_reason.as_deref().unwrap_or(DEFAULT_FAILURE_REASON);
            self.monitor.record_saga_failed(&saga.saga_id, reason);
        }
    }

    /// Cancels an active saga on behalf of its user.
    ///
    /// A forward saga is failed with reason "user cancellation" and
    /// compensated. A saga already compensating only gains an audit entry.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_by_user(&self, saga_id: &SagaId) -> Result<SagaState> {
        let mut saga = self.get_saga(saga_id).await?;
        if !saga.is_active() {
            return Err(SagaError::InvalidTransition {
                saga_id: saga_id.clone(),
                status: saga.status,
            });
        }

        let previous = saga.status;
        saga.record(AuditKind::UserCancellation, "Saga cancelled by user");
        if saga.is_compensating() {
            tracing::info!("cancellation requested while already compensating");
            return Ok(self.store.save(saga, None).await?);
        }

        self.apply_failure(&mut saga, "user cancellation")?;
        tracing::info!("saga cancelled by user");
        self.advance_with(saga, previous, None).await
    }

    /// Sweeps active sagas whose current step outlived its deadline.
    #[tracing::instrument(skip(self))]
    pub async fn check_for_timeouts(&self) -> Result<TimeoutSweep> {
        let config = self.config.clone();
        self.sweep(self.config.shortest_deadline(), move |step| {
            config.deadline_for(step)
        })
        .await
    }

    /// Sweeps with one deadline for every step.
    pub async fn check_for_timeouts_with(&self, deadline: Duration) -> Result<TimeoutSweep> {
        self.sweep(deadline, move |_| deadline).await
    }

    async fn sweep<F>(&self, shortest: Duration, deadline_for: F) -> Result<TimeoutSweep>
    where
        F: Fn(SagaStep) -> Duration,
    {
        let now = Utc::now();
        let cutoff = deadline_cutoff(now, shortest);
        let candidates = self.store.find_stuck(cutoff).await?;

        let mut sweep = TimeoutSweep::default();
        for saga in candidates {
            sweep.examined += 1;
            let deadline = deadline_for(saga.current_step);
            if !saga.step_started_before(deadline_cutoff(now, deadline)) {
                sweep.skipped += 1;
                continue;
            }

            match self.handle_timeout(&saga.saga_id, deadline).await {
                Ok(TimeoutAction::Retried) => sweep.retried += 1,
                Ok(TimeoutAction::Failed) => sweep.failed += 1,
                Ok(TimeoutAction::Skipped) => sweep.skipped += 1,
                Err(e) => {
                    sweep.errors += 1;
                    tracing::warn!(saga_id = %saga.saga_id, error = %e, "timeout handling failed");
                }
            }
        }

        if sweep.examined > 0 {
            tracing::info!(
                examined = sweep.examined,
                retried = sweep.retried,
                failed = sweep.failed,
                skipped = sweep.skipped,
                errors = sweep.errors,
                "timeout sweep finished"
            );
        }
        Ok(sweep)
    }

    async fn handle_timeout(&self, saga_id: &SagaId, deadline: Duration) -> Result<TimeoutAction> {
        let lock_key = saga_lock_key(saga_id.as_str());
        let grant = self.lock.try_acquire(&lock_key, SAGA_LOCK_TTL).await?;
        let Some(token) = grant.fencing_token.filter(|_| grant.granted) else {
            tracing::debug!(saga_id = %saga_id, "saga locked elsewhere, skipping timeout");
            return Ok(TimeoutAction::Skipped);
        };

        let result = self.handle_timeout_locked(saga_id, deadline).await;

        if let Err(e) = self.lock.release(&lock_key, token).await {
            tracing::warn!(lock_key = %lock_key, error = %e, "saga lock release failed");
        }
        result
    }

    async fn handle_timeout_locked(
        &self,
        saga_id: &SagaId,
        deadline: Duration,
    ) -> Result<TimeoutAction> {
        // Re-check under the lock: a reply may have moved the saga on.
        let Some(mut saga) = self.store.find_by_id(saga_id).await? else {
            return Ok(TimeoutAction::Skipped);
        };
        if !saga.is_active() || !saga.step_started_before(deadline_cutoff(Utc::now(), deadline)) {
            return Ok(TimeoutAction::Skipped);
        }

        self.monitor.record_timeout();
        let previous = saga.status;
        let step = saga.current_step;

        if saga.is_compensating() {
            let reason = format!("compensation step {step} timed out");
            self.apply_failure(&mut saga, &reason)?;
            let saga = self.advance_with(saga, previous, None).await?;
            return Ok(if saga.is_compensating() {
                TimeoutAction::Retried
            } else {
                TimeoutAction::Failed
            });
        }

        if saga.try_retry()? {
            let saga = self.store.save(saga, None).await?;
            let retry_count = saga.retry_count;
            let delay = jittered_retry_delay(
                self.config.retry_base_delay,
                self.config.retry_max_delay,
                retry_count,
            );
            tracing::info!(
                saga_id = %saga_id,
                step = %step,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                "step timed out, retry scheduled"
            );
            self.schedule_retry(saga_id.clone(), step, retry_count, delay)
                .await;
            return Ok(TimeoutAction::Retried);
        }

        let reason = format!("timed out after {} retries", saga.max_retries);
        self.apply_failure(&mut saga, &reason)?;
        self.advance_with(saga, previous, None).await?;
        Ok(TimeoutAction::Failed)
    }

    async fn schedule_retry(&self, saga_id: SagaId, step: SagaStep, retry_count: u32, delay: Duration) {
        if delay.is_zero() {
            if let Err(e) = self.execute_retry(&saga_id, step, retry_count).await {
                tracing::warn!(saga_id = %saga_id, error = %e, "retry failed");
            }
            return;
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = orchestrator.execute_retry(&saga_id, step, retry_count).await {
                tracing::warn!(saga_id = %saga_id, error = %e, "delayed retry failed");
            }
        });
    }

    /// Re-issues the command of a retried step.
    ///
    /// Does nothing and returns false if the saga has since left the step
    /// or spent another retry on it.
    pub async fn execute_retry(
        &self,
        saga_id: &SagaId,
        step: SagaStep,
        retry_count: u32,
    ) -> Result<bool> {
        let Some(saga) = self.store.find_by_id(saga_id).await? else {
            return Ok(false);
        };
        if !saga.is_active() || saga.current_step != step || saga.retry_count != retry_count {
            tracing::debug!(saga_id = %saga_id, "retry superseded");
            return Ok(false);
        }
        self.dispatch(saga).await?;
        Ok(true)
    }

    pub async fn get_saga(&self, saga_id: &SagaId) -> Result<SagaState> {
        self.store
            .find_by_id(saga_id)
            .await?
            .ok_or_else(|| SagaError::NotFound {
                saga_id: saga_id.clone(),
            })
    }

    /// Every saga started for an order, newest first.
    pub async fn sagas_for_order(&self, order_id: i64) -> Result<Vec<SagaState>> {
        Ok(self.store.find_by_order_id(order_id).await?)
    }

    pub async fn find_by_user(&self, user_id: &str) -> Result<Vec<SagaState>> {
        Ok(self.store.find_by_user_id(user_id).await?)
    }

    pub async fn active_sagas(&self) -> Result<Vec<SagaState>> {
        Ok(self.store.find_active().await?)
    }

    pub fn health(&self) -> HealthSnapshot {
        self.monitor.snapshot()
    }

    /// Releases every lock this instance holds. Called on shutdown.
    pub async fn release_held_locks(&self) -> Result<u64> {
        let released = self.lock.release_all().await?;
        tracing::info!(released, "released held locks");
        Ok(released)
    }
}

#[async_trait]
impl<S, L, P> MessageHandler for SagaOrchestrator<S, L, P>
where
    S: SagaStore + 'static,
    L: DistributedLock + 'static,
    P: MessagePublisher + 'static,
{
    async fn handle(&self, topic: &str, envelope: MessageEnvelope) -> Result<()> {
        let topics = &self.config.topics;

        if topic == topics.dead_letter {
            tracing::error!(
                topic,
                message_id = ?envelope.message_id,
                saga_id = ?envelope.saga_id,
                message_type = %envelope.message_type,
                payload = %envelope.payload,
                "dead-lettered message needs manual inspection"
            );
            self.monitor.record_dead_letter(topic);
            return Ok(());
        }

        if topic == topics.saga_events {
            return match envelope.require_type()? {
                SAGA_TIMEOUT_CHECK => self.check_for_timeouts().await.map(|_| ()),
                SAGA_EXTERNAL_CANCEL_REQUEST => {
                    let saga_id = envelope.require_saga_id()?.clone();
                    self.cancel_by_user(&saga_id).await.map(|_| ())
                }
                other => {
                    tracing::debug!(message_type = other, "ignoring saga event");
                    Ok(())
                }
            };
        }

        let saga_id = envelope.saga_id.clone();
        let message_type = envelope.message_type.clone();
        let result = self.handle_event(envelope).await;
        if result.is_err()
            && let Some(saga_id) = saga_id
        {
            self.monitor.record_message_failed(&saga_id, &message_type);
        }
        result.map(|_| ())
    }
}

fn ledger_result(outcome: &str, saga: &SagaState) -> Value {
    json!({
        "result": outcome,
        "sagaStatus": saga.status,
        "currentStep": saga.current_step,
    })
}

/// The attempt a reply answers, used in its ledger key.
///
/// A reply echoing the command's `attempt` is keyed by it. Otherwise a reply
/// carrying a message id is keyed by the saga's current attempt, and one
/// without an id is keyed by step and type alone so that every redelivery
/// re-derives the same key whatever the saga's counters have become.
fn reply_attempt(envelope: &MessageEnvelope, saga: &SagaState) -> i32 {
    if let Some(attempt) = envelope
        .payload
        .get("attempt")
        .and_then(Value::as_i64)
        .and_then(|attempt| i32::try_from(attempt).ok())
    {
        return attempt;
    }
    match envelope.message_id {
        Some(_) => saga.phase_attempt() as i32,
        None => 0,
    }
}

fn deadline_cutoff(now: DateTime<Utc>, deadline: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(deadline)
        .ok()
        .and_then(|deadline| now.checked_sub_signed(deadline))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryBus;
    use common::MessageId;
    use domain::{NewSaga, RetryLimits};
    use lock::InMemoryLock;
    use saga_store::InMemorySagaStore;

    fn orchestrator() -> SagaOrchestrator<InMemorySagaStore, InMemoryLock, InMemoryBus> {
        SagaOrchestrator::new(
            Arc::new(InMemorySagaStore::new()),
            Arc::new(InMemoryLock::new()),
            Arc::new(InMemoryBus::new()),
            SagaConfig::default(),
        )
    }

    fn compensating_saga(retries: u32) -> SagaState {
        let mut saga = SagaState::initiate(
            SagaId::new("saga-1"),
            NewSaga {
                order_id: 500,
                user_id: "user-1".to_string(),
                user_email: "user@example.com".to_string(),
                user_name: "Test User".to_string(),
                description: "Test order".to_string(),
                total_amount: common::Money::from_cents(12000),
            },
            RetryLimits::default(),
        );
        saga.complete_forward_step().unwrap();
        saga.fail("boom").unwrap();
        saga.begin_compensation().unwrap();
        for _ in 0..retries {
            saga.compensation_failed("flaky").unwrap();
        }
        saga
    }

    #[test]
    fn test_reply_attempt_without_id_ignores_saga_counters() {
        let envelope = MessageEnvelope::new("PAYMENT_REVERSE_FAILED", json!({}));
        assert_eq!(reply_attempt(&envelope, &compensating_saga(0)), 0);
        assert_eq!(reply_attempt(&envelope, &compensating_saga(2)), 0);
    }

    #[test]
    fn test_reply_attempt_prefers_echo_then_saga_counter() {
        let saga = compensating_saga(2);
        let with_id = MessageEnvelope::new("PAYMENT_REVERSE_FAILED", json!({}))
            .with_message_id(MessageId::new("MSG-1"));
        assert_eq!(reply_attempt(&with_id, &saga), 2);

        let echoed = MessageEnvelope::new("PAYMENT_REVERSE_FAILED", json!({"attempt": 1}));
        assert_eq!(reply_attempt(&echoed, &saga), 1);
    }

    #[tokio::test]
    async fn test_existing_for_order_reports_missing_order() {
        let err = orchestrator().existing_for_order(7).await.unwrap_err();
        assert!(matches!(err, SagaError::OrderNotFound { order_id: 7 }));
    }
}
