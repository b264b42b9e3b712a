use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::events::EventType;
use crate::models::{OrderStatus, TradingKey};

/// Errors returned by an exchange adapter.
///
/// The execution engine's retry policy keys off [`ExchangeError::is_transient`]:
/// network failures, timeouts and rate limits are retried, everything the venue
/// rejected on its merits is surfaced immediately.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by venue (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("pair {0} is not tradable on this venue")]
    NotTradable(String),

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("venue error: {0}")]
    Venue(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_) | ExchangeError::Timeout(_) | ExchangeError::RateLimited { .. }
        )
    }

    /// Venue-provided back-off hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Stable short code recorded in OrderFailed payloads.
    pub fn code(&self) -> &'static str {
        match self {
            ExchangeError::Network(_) => "network",
            ExchangeError::Timeout(_) => "timeout",
            ExchangeError::RateLimited { .. } => "rate_limited",
            ExchangeError::InvalidOrder(_) => "invalid_order",
            ExchangeError::InsufficientBalance(_) => "insufficient_balance",
            ExchangeError::NotTradable(_) => "not_tradable",
            ExchangeError::OrderNotFound(_) => "order_not_found",
            ExchangeError::Venue(_) => "venue_error",
        }
    }
}

/// Order state machine violations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrderError {
    #[error("order {id}: illegal status transition {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("order {id}: filled quantity {filled} exceeds requested {requested}")]
    Overfill {
        id: Uuid,
        filled: Decimal,
        requested: Decimal,
    },

    #[error("order {id}: filled quantity cannot decrease ({current} -> {proposed})")]
    FillRegression {
        id: Uuid,
        current: Decimal,
        proposed: Decimal,
    },

    #[error("order {0} is terminal and cannot be modified")]
    Terminal(Uuid),
}

/// An event that cannot be folded into the aggregate it targets.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("{event_type} cannot start a new {aggregate}")]
    NotACreationEvent {
        aggregate: &'static str,
        event_type: EventType,
    },

    #[error("{event_type} does not apply to {aggregate} {id} in its current state")]
    Unexpected {
        aggregate: &'static str,
        id: Uuid,
        event_type: EventType,
    },

    #[error("event for aggregate {actual} folded into {expected}")]
    WrongAggregate { expected: Uuid, actual: Uuid },

    #[error(transparent)]
    Order(#[from] OrderError),
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure to durably record an event. Once surfaced by the event log this is fatal.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log unavailable after {attempts} attempt(s): {message}")]
    Unavailable { attempts: u32, message: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("invalid order request: {0}")]
    InvalidRequest(String),

    #[error("unknown venue: {0}")]
    UnknownVenue(String),

    #[error("an order is already in flight for {0}")]
    InFlight(TradingKey),

    #[error("position already open for {0}")]
    PositionAlreadyOpen(TradingKey),

    #[error("position {0} not found")]
    PositionNotFound(Uuid),

    #[error("position {0} is not open")]
    PositionNotOpen(Uuid),

    #[error("order {order_id} failed after {attempts} attempt(s): {source}")]
    OrderFailed {
        order_id: Uuid,
        attempts: u32,
        source: ExchangeError,
    },

    #[error("order {order_id} did not resolve within {timeout:?}")]
    Timeout { order_id: Uuid, timeout: Duration },

    #[error("execution engine is draining, no new orders accepted")]
    ShuttingDown,

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ExecutionError {
    /// Consistency violations are rejected synchronously and logged at warning level.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            ExecutionError::InFlight(_)
                | ExecutionError::PositionAlreadyOpen(_)
                | ExecutionError::PositionNotOpen(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unknown strategy plugin: {0}")]
    UnknownStrategy(String),

    #[error("unknown indicator plugin: {0}")]
    UnknownIndicator(String),

    #[error("{plugin}: invalid parameter: {message}")]
    InvalidParameter { plugin: String, message: String },

    #[error("not enough candles: need {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("missing indicator value: {0}")]
    MissingIndicator(String),
}

impl PluginError {
    pub fn invalid(plugin: &str, message: impl Into<String>) -> Self {
        PluginError::InvalidParameter {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }
}

/// Fatal startup errors. The process never partially starts on one of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Network("reset".into()).is_transient());
        assert!(ExchangeError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ExchangeError::RateLimited { retry_after: None }.is_transient());

        assert!(!ExchangeError::InvalidOrder("bad qty".into()).is_transient());
        assert!(!ExchangeError::InsufficientBalance("USDT".into()).is_transient());
        assert!(!ExchangeError::NotTradable("FOO/USDT".into()).is_transient());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = ExchangeError::RateLimited {
            retry_after: Some(Duration::from_millis(1500)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(ExchangeError::Network("x".into()).retry_after(), None);
        assert_eq!(err.code(), "rate_limited");
    }
}
