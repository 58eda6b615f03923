//! The saga state entity.
//!
//! `SagaState` holds everything the orchestrator knows about one order
//! purchase. Its fields are plain data so stores can map them to rows, but
//! every status change goes through the methods below, which reject edges
//! that are not in the status diagram and append to the audit trail.

use chrono::{DateTime, Duration, Utc};
use common::{Money, SagaId};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEvent, AuditKind};
use crate::error::{Result, SagaModelError};
use crate::status::SagaStatus;
use crate::step::{SagaStep, first_compensation_step};

/// Input for starting a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSaga {
    pub order_id: i64,
    pub user_id: String,
    pub user_email: String,
    pub user_name: String,
    pub description: String,
    pub total_amount: Money,
}

/// Retry budgets copied onto each saga when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimits {
    pub max_retries: u32,
    pub max_compensation_retries: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_compensation_retries: 3,
        }
    }
}

/// What happened after a compensation step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationOutcome {
    /// The same compensation step should be issued again.
    Retry { attempt: u32 },
    /// The budget is spent and the saga is now `COMPENSATION_FAILED`.
    Exhausted,
}

/// Durable state of one saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaState {
    pub saga_id: SagaId,
    pub order_id: i64,
    pub user_id: String,
    pub user_email: String,
    pub user_name: String,
    pub description: String,
    pub total_amount: Money,
    pub current_step: SagaStep,
    pub status: SagaStatus,
    pub completed_steps: Vec<SagaStep>,
    pub events: Vec<AuditEvent>,
    pub start_time: DateTime<Utc>,
    pub current_step_start_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub compensation_retry_count: u32,
    pub max_compensation_retries: u32,
    pub failure_reason: Option<String>,
    pub payment_transaction_id: Option<String>,
    /// Optimistic concurrency version, bumped by the store on every commit.
    pub version: i64,
}

impl SagaState {
    /// Creates a saga positioned at its first step.
    pub fn initiate(saga_id: SagaId, new: NewSaga, limits: RetryLimits) -> Self {
        let now = Utc::now();
        let first = SagaStep::ProcessPayment;
        let mut saga = Self {
            saga_id,
            order_id: new.order_id,
            user_id: new.user_id,
            user_email: new.user_email,
            user_name: new.user_name,
            description: new.description,
            total_amount: new.total_amount,
            current_step: first,
            status: SagaStatus::Started,
            completed_steps: Vec::new(),
            events: Vec::new(),
            start_time: now,
            current_step_start_time: now,
            last_updated_time: now,
            end_time: None,
            retry_count: 0,
            max_retries: limits.max_retries,
            compensation_retry_count: 0,
            max_compensation_retries: limits.max_compensation_retries,
            failure_reason: None,
            payment_transaction_id: None,
            version: 0,
        };
        saga.record(
            AuditKind::SagaInitiated,
            format!("Saga initiated for order {}", saga.order_id),
        );
        saga.record(AuditKind::StepStarted, format!("Starting step {first}"));
        saga
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_compensating(&self) -> bool {
        self.status == SagaStatus::Compensating
    }

    /// Returns true if the current step started at or before `deadline`.
    pub fn step_started_before(&self, deadline: DateTime<Utc>) -> bool {
        self.current_step_start_time <= deadline
    }

    /// Time spent in the current step so far.
    pub fn time_in_current_step(&self, now: DateTime<Utc>) -> Duration {
        now - self.current_step_start_time
    }

    /// Total running time; measured to `end_time` once terminal.
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        self.end_time.unwrap_or(now) - self.start_time
    }

    /// Appends an audit entry.
    pub fn record(&mut self, kind: AuditKind, description: impl Into<String>) {
        self.events.push(AuditEvent::new(kind, description));
        self.touch();
    }

    /// Returns true if an audit entry of `kind` exists.
    pub fn has_audit(&self, kind: AuditKind) -> bool {
        self.events.iter().any(|event| event.kind == kind)
    }

    fn touch(&mut self) {
        self.last_updated_time = Utc::now();
    }

    fn transition(&mut self, to: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(SagaModelError::InvalidTransition {
                saga_id: self.saga_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    fn enter_step(&mut self, step: SagaStep) {
        self.current_step = step;
        self.current_step_start_time = Utc::now();
    }

    fn forward_in_flight(&self) -> Result<()> {
        if matches!(self.status, SagaStatus::Started | SagaStatus::InProgress) {
            Ok(())
        } else {
            Err(SagaModelError::InvalidTransition {
                saga_id: self.saga_id.clone(),
                from: self.status,
                to: SagaStatus::InProgress,
            })
        }
    }

    /// Marks the current forward step done and moves to the next one.
    ///
    /// Returns the new current step. When it is [`SagaStep::Complete`] the
    /// caller finishes the saga with [`SagaState::finish`].
    pub fn complete_forward_step(&mut self) -> Result<SagaStep> {
        self.forward_in_flight()?;
        if self.status == SagaStatus::Started {
            self.transition(SagaStatus::InProgress)?;
        }

        let done = self.current_step;
        let next = done
            .next_step()
            .ok_or_else(|| SagaModelError::UnknownStep(format!("no step after {done}")))?;
        self.completed_steps.push(done);
        self.record(AuditKind::StepCompleted, format!("Step {done} completed"));

        self.enter_step(next);
        self.retry_count = 0;
        if next != SagaStep::Complete {
            self.record(AuditKind::StepStarted, format!("Starting step {next}"));
        }
        Ok(next)
    }

    /// Moves a saga whose forward steps are all done to `COMPLETED`.
    pub fn finish(&mut self) -> Result<()> {
        self.transition(SagaStatus::Completed)?;
        self.current_step = SagaStep::Complete;
        self.end_time = Some(Utc::now());
        self.record(AuditKind::SagaCompleted, "Saga completed successfully");
        Ok(())
    }

    /// Records a forward failure and moves to `FAILED`.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.forward_in_flight()?;
        let reason = reason.into();
        self.transition(SagaStatus::Failed)?;
        self.record(
            AuditKind::StepFailed,
            format!("Step {} failed: {reason}", self.current_step),
        );
        self.failure_reason = Some(reason);
        Ok(())
    }

    /// Leaves `FAILED`, either into compensation or straight to
    /// `COMPENSATION_COMPLETED` when the failed step left nothing to undo.
    ///
    /// Returns the compensation step to issue, if any.
    pub fn begin_compensation(&mut self) -> Result<Option<SagaStep>> {
        if !self.current_step.is_compensable() {
            self.transition(SagaStatus::CompensationCompleted)?;
            self.current_step = SagaStep::Complete;
            self.end_time = Some(Utc::now());
            self.record(
                AuditKind::SagaFailed,
                "Saga failed with nothing to compensate",
            );
            return Ok(None);
        }

        self.transition(SagaStatus::Compensating)?;
        let first = first_compensation_step(&self.completed_steps);
        self.enter_step(first);
        self.compensation_retry_count = 0;
        self.record(
            AuditKind::CompensationStarted,
            format!(
                "Compensation started: {}",
                self.failure_reason.as_deref().unwrap_or("step failed")
            ),
        );
        self.record(
            AuditKind::CompensationStep,
            format!("Starting compensation with step {first}"),
        );
        Ok(Some(first))
    }

    /// Marks the current compensation step done.
    ///
    /// Returns the next compensation step, or `None` once compensation has
    /// finished and the saga is `COMPENSATION_COMPLETED`.
    pub fn complete_compensation_step(&mut self) -> Result<Option<SagaStep>> {
        if self.status != SagaStatus::Compensating {
            return Err(SagaModelError::InvalidTransition {
                saga_id: self.saga_id.clone(),
                from: self.status,
                to: SagaStatus::CompensationCompleted,
            });
        }

        let done = self.current_step;
        let next = done.next_compensation_step().ok_or_else(|| {
            SagaModelError::UnknownStep(format!("no compensation step after {done}"))
        })?;
        self.completed_steps.push(done);
        self.record(
            AuditKind::CompensationStepCompleted,
            format!("Compensation step {done} completed"),
        );

        if next == SagaStep::Complete {
            self.transition(SagaStatus::CompensationCompleted)?;
            self.current_step = SagaStep::Complete;
            self.end_time = Some(Utc::now());
            self.record(
                AuditKind::CompensationCompleted,
                "Compensation completed successfully",
            );
            return Ok(None);
        }

        self.enter_step(next);
        self.compensation_retry_count = 0;
        self.record(
            AuditKind::CompensationStep,
            format!("Starting compensation step {next}"),
        );
        Ok(Some(next))
    }

    /// Handles a failed or timed-out compensation step.
    ///
    /// Spends one unit of the compensation budget if any is left; otherwise
    /// moves to `COMPENSATION_FAILED`.
    pub fn compensation_failed(&mut self, reason: &str) -> Result<CompensationOutcome> {
        if self.status != SagaStatus::Compensating {
            return Err(SagaModelError::InvalidTransition {
                saga_id: self.saga_id.clone(),
                from: self.status,
                to: SagaStatus::CompensationFailed,
            });
        }

        if self.compensation_retry_count < self.max_compensation_retries {
            self.compensation_retry_count += 1;
            self.current_step_start_time = Utc::now();
            self.record(
                AuditKind::CompensationRetry,
                format!(
                    "Retrying compensation step {} ({}/{}): {reason}",
                    self.current_step, self.compensation_retry_count, self.max_compensation_retries
                ),
            );
            return Ok(CompensationOutcome::Retry {
                attempt: self.compensation_retry_count,
            });
        }

        self.transition(SagaStatus::CompensationFailed)?;
        self.end_time = Some(Utc::now());
        self.record(
            AuditKind::CompensationFailed,
            format!(
                "Compensation step {} failed after {} retries, manual intervention required: {reason}",
                self.current_step, self.max_compensation_retries
            ),
        );
        Ok(CompensationOutcome::Exhausted)
    }

    /// Spends one forward retry on the current step.
    ///
    /// Returns false, without mutating, when the budget is already spent.
    pub fn try_retry(&mut self) -> Result<bool> {
        self.forward_in_flight()?;
        if self.retry_count >= self.max_retries {
            return Ok(false);
        }
        self.retry_count += 1;
        self.current_step_start_time = Utc::now();
        self.record(
            AuditKind::Retry,
            format!(
                "Retrying step {} ({}/{})",
                self.current_step, self.retry_count, self.max_retries
            ),
        );
        Ok(true)
    }

    /// Retry counter of the phase the saga is in.
    pub fn phase_attempt(&self) -> u32 {
        if self.is_compensating() {
            self.compensation_retry_count
        } else {
            self.retry_count
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_saga() -> SagaState {
        SagaState::initiate(
            SagaId::new("saga-1"),
            NewSaga {
                order_id: 500,
                user_id: "user-1".to_string(),
                user_email: "user@example.com".to_string(),
                user_name: "Test User".to_string(),
                description: "Test order".to_string(),
                total_amount: Money::from_cents(12000),
            },
            RetryLimits::default(),
        )
    }

    #[test]
    fn test_initiate_positions_at_first_step() {
        let saga = new_saga();
        assert_eq!(saga.status, SagaStatus::Started);
        assert_eq!(saga.current_step, SagaStep::ProcessPayment);
        assert!(saga.completed_steps.is_empty());
        assert!(saga.has_audit(AuditKind::SagaInitiated));
        assert!(saga.has_audit(AuditKind::StepStarted));
        assert_eq!(saga.max_retries, 3);
    }

    #[test]
    fn test_happy_path() {
        let mut saga = new_saga();
        assert_eq!(
            saga.complete_forward_step().unwrap(),
            SagaStep::UpdateOrderConfirmed
        );
        assert_eq!(saga.status, SagaStatus::InProgress);
        assert_eq!(
            saga.complete_forward_step().unwrap(),
            SagaStep::UpdateOrderDelivered
        );
        assert_eq!(saga.complete_forward_step().unwrap(), SagaStep::Complete);
        saga.finish().unwrap();

        assert_eq!(saga.status, SagaStatus::Completed);
        assert_eq!(saga.completed_steps, SagaStep::FORWARD.to_vec());
        assert!(saga.end_time.is_some());
        assert!(saga.has_audit(AuditKind::SagaCompleted));
    }

    #[test]
    fn test_finish_requires_in_progress() {
        let mut saga = new_saga();
        assert!(matches!(
            saga.finish(),
            Err(SagaModelError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_payment_failure_compensates_order_only() {
        let mut saga = new_saga();
        saga.fail("card declined").unwrap();
        assert_eq!(saga.status, SagaStatus::Failed);
        assert_eq!(saga.failure_reason.as_deref(), Some("card declined"));

        let step = saga.begin_compensation().unwrap();
        assert_eq!(step, Some(SagaStep::CancelOrder));
        assert_eq!(saga.status, SagaStatus::Compensating);

        assert_eq!(saga.complete_compensation_step().unwrap(), None);
        assert_eq!(saga.status, SagaStatus::CompensationCompleted);
        assert_eq!(saga.current_step, SagaStep::Complete);
    }

    #[test]
    fn test_late_failure_reverses_payment_first() {
        let mut saga = new_saga();
        saga.complete_forward_step().unwrap();
        saga.fail("order service down").unwrap();
        assert_eq!(
            saga.begin_compensation().unwrap(),
            Some(SagaStep::CancelPayment)
        );
        assert_eq!(
            saga.complete_compensation_step().unwrap(),
            Some(SagaStep::CancelOrder)
        );
        assert_eq!(saga.complete_compensation_step().unwrap(), None);
        assert_eq!(saga.status, SagaStatus::CompensationCompleted);
        assert!(saga.has_audit(AuditKind::CompensationCompleted));
    }

    #[test]
    fn test_compensation_budget() {
        let mut saga = new_saga();
        saga.complete_forward_step().unwrap();
        saga.fail("boom").unwrap();
        saga.begin_compensation().unwrap();

        for attempt in 1..=3 {
            assert_eq!(
                saga.compensation_failed("reverse failed").unwrap(),
                CompensationOutcome::Retry { attempt }
            );
            assert_eq!(saga.current_step, SagaStep::CancelPayment);
        }
        assert_eq!(
            saga.compensation_failed("reverse failed").unwrap(),
            CompensationOutcome::Exhausted
        );
        assert_eq!(saga.status, SagaStatus::CompensationFailed);
        assert!(saga.compensation_failed("again").is_err());
    }

    #[test]
    fn test_compensation_counter_resets_per_step() {
        let mut saga = new_saga();
        saga.complete_forward_step().unwrap();
        saga.fail("boom").unwrap();
        saga.begin_compensation().unwrap();
        saga.compensation_failed("flaky").unwrap();
        assert_eq!(saga.compensation_retry_count, 1);

        saga.complete_compensation_step().unwrap();
        assert_eq!(saga.compensation_retry_count, 0);
        assert_eq!(saga.phase_attempt(), 0);
    }

    #[test]
    fn test_retry_budget() {
        let mut saga = new_saga();
        assert!(saga.try_retry().unwrap());
        assert!(saga.try_retry().unwrap());
        assert!(saga.try_retry().unwrap());
        assert!(!saga.try_retry().unwrap());
        assert_eq!(saga.retry_count, 3);
        assert_eq!(
            saga.events
                .iter()
                .filter(|e| e.kind == AuditKind::Retry)
                .count(),
            3
        );
    }

    #[test]
    fn test_retry_count_resets_on_next_step() {
        let mut saga = new_saga();
        saga.try_retry().unwrap();
        saga.complete_forward_step().unwrap();
        assert_eq!(saga.retry_count, 0);
    }

    #[test]
    fn test_terminal_saga_rejects_everything() {
        let mut saga = new_saga();
        saga.fail("boom").unwrap();
        saga.begin_compensation().unwrap();
        saga.complete_compensation_step().unwrap();
        let snapshot = (saga.status, saga.current_step);

        assert!(saga.complete_forward_step().is_err());
        assert!(saga.fail("again").is_err());
        assert!(saga.begin_compensation().is_err());
        assert!(saga.complete_compensation_step().is_err());
        assert!(saga.try_retry().is_err());
        assert!(saga.finish().is_err());
        assert_eq!((saga.status, saga.current_step), snapshot);
    }

    #[test]
    fn test_step_started_before() {
        let mut saga = new_saga();
        let now = Utc::now();
        saga.current_step_start_time = now - Duration::minutes(20);
        assert!(saga.step_started_before(now - Duration::minutes(10)));
        assert!(!saga.step_started_before(now - Duration::minutes(30)));
    }

    #[test]
    fn test_serializes_camel_case() {
        let saga = new_saga();
        let json = serde_json::to_value(&saga).unwrap();
        assert_eq!(json["sagaId"], "saga-1");
        assert_eq!(json["currentStep"], "PROCESS_PAYMENT");
        assert_eq!(json["status"], "STARTED");
        assert_eq!(json["totalAmount"], 12000);
    }
}
