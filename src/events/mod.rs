// Append-only audit trail and the projections rebuilt from it
pub mod log;
pub mod projection;

pub use log::{EventLog, EventLogConfig, EventStream};
pub use projection::Aggregate;

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{
    ExitReason, Order, OrderStatus, Position, Signal, SignalAction, TradingKey,
};

/// Aggregate id for portfolio-wide events (drawdown, trading pause/resume).
pub const PORTFOLIO_AGGREGATE_ID: Uuid = Uuid::from_u128(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Order,
    Position,
    Signal,
    Portfolio,
}

impl AggregateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::Order => "order",
            AggregateType::Position => "position",
            AggregateType::Signal => "signal",
            AggregateType::Portfolio => "portfolio",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    SignalGenerated,
    SignalRejected,
    ExposureLimitBreached,
    OrderSubmitted,
    OrderAcknowledged,
    OrderPartiallyFilled,
    OrderFilled,
    OrderCancelled,
    OrderFailed,
    OrderUnreconciled,
    PositionOpened,
    TrailingStopAdjusted,
    StopLossTriggered,
    TakeProfitTriggered,
    TrailingStopTriggered,
    EmergencyExitTriggered,
    ExitRequested,
    ExitOrderPlaced,
    ExitOrderReleased,
    PositionReduced,
    PositionClosed,
    ManualInterventionRequired,
    DrawdownBreached,
    TradingResumed,
    EquitySnapshot,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SignalGenerated => "SignalGenerated",
            EventType::SignalRejected => "SignalRejected",
            EventType::ExposureLimitBreached => "ExposureLimitBreached",
            EventType::OrderSubmitted => "OrderSubmitted",
            EventType::OrderAcknowledged => "OrderAcknowledged",
            EventType::OrderPartiallyFilled => "OrderPartiallyFilled",
            EventType::OrderFilled => "OrderFilled",
            EventType::OrderCancelled => "OrderCancelled",
            EventType::OrderFailed => "OrderFailed",
            EventType::OrderUnreconciled => "OrderUnreconciled",
            EventType::PositionOpened => "PositionOpened",
            EventType::TrailingStopAdjusted => "TrailingStopAdjusted",
            EventType::StopLossTriggered => "StopLossTriggered",
            EventType::TakeProfitTriggered => "TakeProfitTriggered",
            EventType::TrailingStopTriggered => "TrailingStopTriggered",
            EventType::EmergencyExitTriggered => "EmergencyExitTriggered",
            EventType::ExitRequested => "ExitRequested",
            EventType::ExitOrderPlaced => "ExitOrderPlaced",
            EventType::ExitOrderReleased => "ExitOrderReleased",
            EventType::PositionReduced => "PositionReduced",
            EventType::PositionClosed => "PositionClosed",
            EventType::ManualInterventionRequired => "ManualInterventionRequired",
            EventType::DrawdownBreached => "DrawdownBreached",
            EventType::TradingResumed => "TradingResumed",
            EventType::EquitySnapshot => "EquitySnapshot",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            EventType::SignalGenerated,
            EventType::SignalRejected,
            EventType::ExposureLimitBreached,
            EventType::OrderSubmitted,
            EventType::OrderAcknowledged,
            EventType::OrderPartiallyFilled,
            EventType::OrderFilled,
            EventType::OrderCancelled,
            EventType::OrderFailed,
            EventType::OrderUnreconciled,
            EventType::PositionOpened,
            EventType::TrailingStopAdjusted,
            EventType::StopLossTriggered,
            EventType::TakeProfitTriggered,
            EventType::TrailingStopTriggered,
            EventType::EmergencyExitTriggered,
            EventType::ExitRequested,
            EventType::ExitOrderPlaced,
            EventType::ExitOrderReleased,
            EventType::PositionReduced,
            EventType::PositionClosed,
            EventType::ManualInterventionRequired,
            EventType::DrawdownBreached,
            EventType::TradingResumed,
            EventType::EquitySnapshot,
        ];
        all.into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type '{}'", s))
    }
}

/// Type-specific event body. The variant determines the event type and aggregate type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SignalGenerated {
        signal: Signal,
    },
    SignalRejected {
        key: TradingKey,
        action: SignalAction,
        rule: String,
        reason: String,
    },
    ExposureLimitBreached {
        key: TradingKey,
        scope: String,
        limit: Decimal,
        current: Decimal,
        proposed: Decimal,
    },

    OrderSubmitted {
        order: Order,
    },
    OrderAcknowledged {
        venue_order_id: String,
        status: OrderStatus,
    },
    OrderPartiallyFilled {
        filled_quantity: Decimal,
        average_fill_price: Option<Decimal>,
        fee: Decimal,
        fee_currency: Option<String>,
    },
    OrderFilled {
        filled_quantity: Decimal,
        average_fill_price: Option<Decimal>,
        fee: Decimal,
        fee_currency: Option<String>,
    },
    OrderCancelled {
        filled_quantity: Decimal,
        reason: String,
    },
    OrderFailed {
        error_code: String,
        reason: String,
        attempts: u32,
    },
    OrderUnreconciled {
        status: OrderStatus,
        reason: String,
    },

    PositionOpened {
        position: Position,
    },
    TrailingStopAdjusted {
        best_price: Decimal,
        stop_price: Decimal,
        distance_pct: Decimal,
    },
    StopLossTriggered {
        price: Decimal,
        loss_pct: Decimal,
        threshold_pct: Decimal,
    },
    TakeProfitTriggered {
        price: Decimal,
        gain_pct: Decimal,
        threshold_pct: Decimal,
        close_quantity: Option<Decimal>,
    },
    TrailingStopTriggered {
        price: Decimal,
        stop_price: Decimal,
    },
    EmergencyExitTriggered {
        price: Option<Decimal>,
        drawdown_pct: Decimal,
    },
    ExitRequested {
        reason: ExitReason,
        quantity: Option<Decimal>,
    },
    ExitOrderPlaced {
        order_id: Uuid,
    },
    ExitOrderReleased {
        order_id: Option<Uuid>,
        reason: String,
        failed: bool,
    },
    PositionReduced {
        order_id: Uuid,
        quantity: Decimal,
        exit_price: Decimal,
        realized_pnl: Decimal,
        remaining: Decimal,
    },
    PositionClosed {
        order_id: Option<Uuid>,
        quantity: Decimal,
        exit_price: Decimal,
        realized_pnl: Decimal,
        realized_pnl_pct: Decimal,
    },
    ManualInterventionRequired {
        exit_failures: u32,
        last_error: String,
    },

    DrawdownBreached {
        drawdown_pct: Decimal,
        threshold_pct: Decimal,
        equity: Decimal,
        peak_equity: Decimal,
    },
    TradingResumed {
        reason: String,
    },
    EquitySnapshot {
        equity: Decimal,
        peak_equity: Decimal,
        drawdown_pct: Decimal,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::SignalGenerated { .. } => EventType::SignalGenerated,
            EventPayload::SignalRejected { .. } => EventType::SignalRejected,
            EventPayload::ExposureLimitBreached { .. } => EventType::ExposureLimitBreached,
            EventPayload::OrderSubmitted { .. } => EventType::OrderSubmitted,
            EventPayload::OrderAcknowledged { .. } => EventType::OrderAcknowledged,
            EventPayload::OrderPartiallyFilled { .. } => EventType::OrderPartiallyFilled,
            EventPayload::OrderFilled { .. } => EventType::OrderFilled,
            EventPayload::OrderCancelled { .. } => EventType::OrderCancelled,
            EventPayload::OrderFailed { .. } => EventType::OrderFailed,
            EventPayload::OrderUnreconciled { .. } => EventType::OrderUnreconciled,
            EventPayload::PositionOpened { .. } => EventType::PositionOpened,
            EventPayload::TrailingStopAdjusted { .. } => EventType::TrailingStopAdjusted,
            EventPayload::StopLossTriggered { .. } => EventType::StopLossTriggered,
            EventPayload::TakeProfitTriggered { .. } => EventType::TakeProfitTriggered,
            EventPayload::TrailingStopTriggered { .. } => EventType::TrailingStopTriggered,
            EventPayload::EmergencyExitTriggered { .. } => EventType::EmergencyExitTriggered,
            EventPayload::ExitRequested { .. } => EventType::ExitRequested,
            EventPayload::ExitOrderPlaced { .. } => EventType::ExitOrderPlaced,
            EventPayload::ExitOrderReleased { .. } => EventType::ExitOrderReleased,
            EventPayload::PositionReduced { .. } => EventType::PositionReduced,
            EventPayload::PositionClosed { .. } => EventType::PositionClosed,
            EventPayload::ManualInterventionRequired { .. } => {
                EventType::ManualInterventionRequired
            }
            EventPayload::DrawdownBreached { .. } => EventType::DrawdownBreached,
            EventPayload::TradingResumed { .. } => EventType::TradingResumed,
            EventPayload::EquitySnapshot { .. } => EventType::EquitySnapshot,
        }
    }

    pub fn aggregate_type(&self) -> AggregateType {
        use EventPayload::*;
        match self {
            SignalGenerated { .. } | SignalRejected { .. } | ExposureLimitBreached { .. } => {
                AggregateType::Signal
            }
            OrderSubmitted { .. }
            | OrderAcknowledged { .. }
            | OrderPartiallyFilled { .. }
            | OrderFilled { .. }
            | OrderCancelled { .. }
            | OrderFailed { .. }
            | OrderUnreconciled { .. } => AggregateType::Order,
            DrawdownBreached { .. } | TradingResumed { .. } | EquitySnapshot { .. } => {
                AggregateType::Portfolio
            }
            _ => AggregateType::Position,
        }
    }
}

/// Immutable audit record.
///
/// `sequence` is assigned by the event repository on append: 1-based and gap-free per aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub aggregate_type: AggregateType,
    pub sequence: i64,
    pub occurred_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl DomainEvent {
    /// Timestamps carry microsecond precision, the finest the event store keeps.
    pub fn new(aggregate_id: Uuid, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id,
            aggregate_type: payload.aggregate_type(),
            sequence: 0,
            occurred_at: Utc::now().trunc_subsecs(6),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}
