// Order placement, tracking and the event-sourced position book
pub mod engine;
pub mod in_flight;
pub mod position_store;
pub mod retry;

pub use engine::{EntryOrder, ExecutionEngine, ExitOrder, OrderDirective, OrderOutcome};
pub use in_flight::{InFlightGuard, InFlightTable};
pub use position_store::PositionStore;
pub use retry::{ExponentialBackoff, RetryExhausted, RetryPolicy};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Placement plus tracking budget for one order
    pub order_timeout_secs: u64,
    pub status_poll_interval_ms: u64,
    /// Timeout for a single venue call
    pub venue_call_timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Failed exit rounds before a position is flagged for manual intervention
    pub max_exit_retry_rounds: u32,
    pub drain_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_timeout_secs: 30,
            status_poll_interval_ms: 500,
            venue_call_timeout_secs: 10,
            retry: RetryPolicy::default(),
            max_exit_retry_rounds: 3,
            drain_timeout_secs: 30,
        }
    }
}

impl ExecutionConfig {
    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.venue_call_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.order_timeout_secs == 0 || self.venue_call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "execution timeouts must be positive".to_string(),
            ));
        }
        if self.status_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "execution.status_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "execution.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_exit_retry_rounds == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_exit_retry_rounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
