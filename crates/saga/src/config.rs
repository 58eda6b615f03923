//! Orchestrator configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use domain::{Capability, CommandType, RetryLimits, SagaStep};

/// Names of the channels the orchestrator publishes to and consumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub order_commands: String,
    pub payment_commands: String,
    pub order_events: String,
    pub payment_events: String,
    pub saga_events: String,
    pub dead_letter: String,
}

impl Topics {
    /// Channel a command is published to.
    pub fn for_command(&self, command: CommandType) -> &str {
        match command.capability() {
            Capability::Payment => &self.payment_commands,
            Capability::Order => &self.order_commands,
        }
    }

    /// Returns true if events on `topic` are replies to saga commands.
    pub fn is_reply_topic(&self, topic: &str) -> bool {
        topic == self.order_events || topic == self.payment_events
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            order_commands: "order-commands".to_string(),
            payment_commands: "payment-commands".to_string(),
            order_events: "order-events".to_string(),
            payment_events: "payment-events".to_string(),
            saga_events: "saga-events".to_string(),
            dead_letter: "saga.dlq".to_string(),
        }
    }
}

/// Orchestrator settings with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_MAX_RETRIES` (default: `3`)
/// - `SAGA_MAX_COMPENSATION_RETRIES` (default: `3`)
/// - `SAGA_STEP_TIMEOUT_SECS` (default: `600`)
/// - `SAGA_PAYMENT_TIMEOUT_SECS` (default: `300`)
/// - `SAGA_ORDER_TIMEOUT_SECS` (default: `900`)
/// - `SAGA_TIMEOUT_CHECK_INTERVAL_SECS` (default: `30`)
/// - `SAGA_RETRY_BASE_DELAY_MS` (default: `5000`)
/// - `SAGA_RETRY_MAX_DELAY_MS` (default: `60000`)
/// - `SAGA_LEDGER_RETENTION_DAYS` (default: `30`)
/// - `SAGA_RETENTION_DAYS` (default: `30`)
/// - `SAGA_MAINTENANCE_INTERVAL_SECS` (default: `86400`)
/// - `SAGA_WORKER_PARTITIONS` (default: `8`)
/// - `SAGA_MAX_ACTIVE` (default: `1000`)
/// - `SAGA_FAILURE_RATE_THRESHOLD` (default: `0.10`)
#[derive(Debug, Clone)]
pub struct SagaConfig {
    pub max_retries: u32,
    pub max_compensation_retries: u32,
    pub step_timeout: Duration,
    pub payment_timeout: Duration,
    pub order_timeout: Duration,
    pub timeout_check_interval: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub ledger_retention: Duration,
    pub saga_retention: Duration,
    pub maintenance_interval: Duration,
    pub worker_partitions: usize,
    pub max_active_sagas: u64,
    pub failure_rate_threshold: f64,
    pub payment_lock_ttl: Duration,
    pub order_lock_ttl: Duration,
    pub topics: Topics,
}

const DAY_SECS: u64 = 24 * 60 * 60;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SagaConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_or("SAGA_MAX_RETRIES", defaults.max_retries),
            max_compensation_retries: env_or(
                "SAGA_MAX_COMPENSATION_RETRIES",
                defaults.max_compensation_retries,
            ),
            step_timeout: Duration::from_secs(env_or("SAGA_STEP_TIMEOUT_SECS", 600)),
            payment_timeout: Duration::from_secs(env_or("SAGA_PAYMENT_TIMEOUT_SECS", 300)),
            order_timeout: Duration::from_secs(env_or("SAGA_ORDER_TIMEOUT_SECS", 900)),
            timeout_check_interval: Duration::from_secs(env_or(
                "SAGA_TIMEOUT_CHECK_INTERVAL_SECS",
                30,
            )),
            retry_base_delay: Duration::from_millis(env_or("SAGA_RETRY_BASE_DELAY_MS", 5000)),
            retry_max_delay: Duration::from_millis(env_or("SAGA_RETRY_MAX_DELAY_MS", 60_000)),
            ledger_retention: Duration::from_secs(
                env_or("SAGA_LEDGER_RETENTION_DAYS", 30u64) * DAY_SECS,
            ),
            saga_retention: Duration::from_secs(env_or("SAGA_RETENTION_DAYS", 30u64) * DAY_SECS),
            maintenance_interval: Duration::from_secs(env_or(
                "SAGA_MAINTENANCE_INTERVAL_SECS",
                DAY_SECS,
            )),
            worker_partitions: env_or("SAGA_WORKER_PARTITIONS", defaults.worker_partitions).max(1),
            max_active_sagas: env_or("SAGA_MAX_ACTIVE", defaults.max_active_sagas),
            failure_rate_threshold: env_or(
                "SAGA_FAILURE_RATE_THRESHOLD",
                defaults.failure_rate_threshold,
            ),
            ..defaults
        }
    }

    /// Retry budgets stamped onto new sagas.
    pub fn retry_limits(&self) -> RetryLimits {
        RetryLimits {
            max_retries: self.max_retries,
            max_compensation_retries: self.max_compensation_retries,
        }
    }

    /// How long `step` may run before the supervisor treats it as timed out.
    pub fn deadline_for(&self, step: SagaStep) -> Duration {
        match step.command().map(|command| command.capability()) {
            Some(Capability::Payment) => self.payment_timeout,
            Some(Capability::Order) => self.order_timeout,
            None => self.step_timeout,
        }
    }

    /// The shortest per-step deadline, used to bound the stuck-saga query.
    pub fn shortest_deadline(&self) -> Duration {
        self.payment_timeout
            .min(self.order_timeout)
            .min(self.step_timeout)
    }

    /// Lease taken on the entity lock while publishing `command`.
    pub fn lock_ttl_for(&self, command: CommandType) -> Duration {
        match command.capability() {
            Capability::Payment => self.payment_lock_ttl,
            Capability::Order => self.order_lock_ttl,
        }
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_compensation_retries: 3,
            step_timeout: Duration::from_secs(600),
            payment_timeout: Duration::from_secs(300),
            order_timeout: Duration::from_secs(900),
            timeout_check_interval: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(5000),
            retry_max_delay: Duration::from_millis(60_000),
            ledger_retention: Duration::from_secs(30 * DAY_SECS),
            saga_retention: Duration::from_secs(30 * DAY_SECS),
            maintenance_interval: Duration::from_secs(DAY_SECS),
            worker_partitions: 8,
            max_active_sagas: 1000,
            failure_rate_threshold: 0.10,
            payment_lock_ttl: Duration::from_secs(60),
            order_lock_ttl: Duration::from_secs(30),
            topics: Topics::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = SagaConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_compensation_retries, 3);
        assert_eq!(config.timeout_check_interval, Duration::from_secs(30));
        assert_eq!(config.worker_partitions, 8);
        assert_eq!(config.topics.saga_events, "saga-events");
    }

    #[test]
    fn test_commands_route_by_capability() {
        let topics = Topics::default();
        assert_eq!(topics.for_command(CommandType::PaymentProcess), "payment-commands");
        assert_eq!(topics.for_command(CommandType::PaymentReverse), "payment-commands");
        assert_eq!(topics.for_command(CommandType::OrderUpdateConfirmed), "order-commands");
        assert_eq!(topics.for_command(CommandType::OrderCancel), "order-commands");
        assert!(topics.is_reply_topic("payment-events"));
        assert!(!topics.is_reply_topic("saga-events"));
    }

    #[test]
    fn test_deadline_per_step() {
        let config = SagaConfig::default();
        assert_eq!(config.deadline_for(SagaStep::ProcessPayment), config.payment_timeout);
        assert_eq!(config.deadline_for(SagaStep::CancelPayment), config.payment_timeout);
        assert_eq!(config.deadline_for(SagaStep::UpdateOrderDelivered), config.order_timeout);
        assert_eq!(config.deadline_for(SagaStep::Complete), config.step_timeout);
        assert_eq!(config.shortest_deadline(), Duration::from_secs(300));
    }

    #[test]
    fn test_lock_ttl_per_capability() {
        let config = SagaConfig::default();
        assert_eq!(config.lock_ttl_for(CommandType::PaymentProcess), Duration::from_secs(60));
        assert_eq!(config.lock_ttl_for(CommandType::OrderCancel), Duration::from_secs(30));
    }
}
