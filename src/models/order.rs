use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::TradingKey;
use crate::error::OrderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    // Transitions may only move forward through these ranks.
    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Open => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "open" => Ok(OrderStatus::Open),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(format!("invalid order status '{}'", other)),
        }
    }
}

/// Why the order exists: opening a position or closing (part of) one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderIntent {
    Entry,
    Exit { position_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub venue_order_id: Option<String>,
    pub strategy_id: String,
    pub venue: String,
    pub pair: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub intent: OrderIntent,
    pub requested_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub price: Option<Decimal>,
    pub average_fill_price: Option<Decimal>,
    pub fee: Decimal,
    pub fee_currency: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_status_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        key: &TradingKey,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
        intent: OrderIntent,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            venue_order_id: None,
            strategy_id: key.strategy_id.clone(),
            venue: key.venue.clone(),
            pair: key.pair.clone(),
            side,
            order_type,
            status: OrderStatus::Pending,
            intent,
            requested_quantity: quantity,
            filled_quantity: Decimal::ZERO,
            price,
            average_fill_price: None,
            fee: Decimal::ZERO,
            fee_currency: None,
            created_at: at,
            updated_at: at,
            last_status_at: at,
        }
    }

    pub fn key(&self) -> TradingKey {
        TradingKey::new(&self.strategy_id, &self.pair, &self.venue)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn remaining(&self) -> Decimal {
        self.requested_quantity - self.filled_quantity
    }

    pub fn position_id(&self) -> Option<Uuid> {
        match self.intent {
            OrderIntent::Exit { position_id } => Some(position_id),
            OrderIntent::Entry => None,
        }
    }

    /// Validate a status change without applying it.
    pub fn check_transition(&self, to: OrderStatus) -> Result<(), OrderError> {
        if self.status.is_terminal() {
            return Err(OrderError::Terminal(self.id));
        }
        if to.rank() < self.status.rank() {
            return Err(OrderError::IllegalTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    /// Validate a cumulative fill quantity without applying it.
    pub fn check_fill(&self, filled: Decimal) -> Result<(), OrderError> {
        if self.status.is_terminal() {
            return Err(OrderError::Terminal(self.id));
        }
        if filled > self.requested_quantity {
            return Err(OrderError::Overfill {
                id: self.id,
                filled,
                requested: self.requested_quantity,
            });
        }
        if filled < self.filled_quantity {
            return Err(OrderError::FillRegression {
                id: self.id,
                current: self.filled_quantity,
                proposed: filled,
            });
        }
        Ok(())
    }

    pub(crate) fn set_status(&mut self, to: OrderStatus, at: DateTime<Utc>) -> Result<(), OrderError> {
        self.check_transition(to)?;
        if to != self.status {
            self.last_status_at = at;
        }
        self.status = to;
        self.updated_at = at;
        Ok(())
    }

    /// Record a cumulative fill; the status follows from the filled amount.
    pub(crate) fn record_fill(
        &mut self,
        filled: Decimal,
        average_price: Option<Decimal>,
        fee: Decimal,
        fee_currency: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        self.check_fill(filled)?;
        let status = if filled == self.requested_quantity {
            OrderStatus::Filled
        } else if filled.is_zero() {
            self.status
        } else {
            OrderStatus::PartiallyFilled
        };
        self.check_transition(status)?;

        self.filled_quantity = filled;
        if average_price.is_some() {
            self.average_fill_price = average_price;
        }
        self.fee = fee;
        if fee_currency.is_some() {
            self.fee_currency = fee_currency;
        }
        self.set_status(status, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn market_order(quantity: Decimal) -> Order {
        Order::new(
            &TradingKey::new("s1", "BTC/USDT", "paper"),
            OrderSide::Buy,
            OrderType::Market,
            quantity,
            None,
            OrderIntent::Entry,
            Utc::now(),
        )
    }

    #[test]
    fn test_new_order_is_pending() {
        let order = market_order(dec!(1.5));
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.filled_quantity, Decimal::ZERO);
        assert_eq!(order.remaining(), dec!(1.5));
        assert!(order.venue_order_id.is_none());
    }

    #[test]
    fn test_status_cannot_move_backwards() {
        let mut order = market_order(dec!(1));
        order.set_status(OrderStatus::Open, Utc::now()).unwrap();
        let err = order.set_status(OrderStatus::Pending, Utc::now()).unwrap_err();
        assert!(matches!(err, OrderError::IllegalTransition { .. }));
    }

    #[test]
    fn test_terminal_order_is_immutable() {
        let mut order = market_order(dec!(1));
        order
            .record_fill(dec!(1), Some(dec!(100)), dec!(0.1), None, Utc::now())
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);

        assert!(matches!(
            order.set_status(OrderStatus::Cancelled, Utc::now()),
            Err(OrderError::Terminal(_))
        ));
        assert!(matches!(
            order.record_fill(dec!(1), None, dec!(0), None, Utc::now()),
            Err(OrderError::Terminal(_))
        ));
    }

    #[test]
    fn test_overfill_rejected() {
        let mut order = market_order(dec!(1));
        let err = order
            .record_fill(dec!(1.01), Some(dec!(100)), dec!(0), None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, OrderError::Overfill { .. }));
        assert_eq!(order.filled_quantity, Decimal::ZERO);
    }

    #[test]
    fn test_partial_then_full_fill() {
        let mut order = market_order(dec!(2));
        order
            .record_fill(dec!(0.5), Some(dec!(100)), dec!(0), None, Utc::now())
            .unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        order
            .record_fill(dec!(2), Some(dec!(101)), dec!(0.2), Some("USDT".into()), Utc::now())
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.average_fill_price, Some(dec!(101)));
        assert_eq!(order.fee_currency.as_deref(), Some("USDT"));
    }

    proptest! {
        #[test]
        fn prop_filled_never_exceeds_requested(fills in prop::collection::vec(0u32..150, 1..20)) {
            let mut order = market_order(dec!(100));
            for f in fills {
                let _ = order.record_fill(Decimal::from(f), None, Decimal::ZERO, None, Utc::now());
                prop_assert!(order.filled_quantity <= order.requested_quantity);
            }
        }

        #[test]
        fn prop_terminal_never_mutated(fills in prop::collection::vec(0u32..150, 1..20)) {
            let mut order = market_order(dec!(100));
            let mut frozen: Option<Order> = None;
            for f in fills {
                let _ = order.record_fill(Decimal::from(f), None, Decimal::ZERO, None, Utc::now());
                if let Some(snapshot) = &frozen {
                    prop_assert_eq!(snapshot, &order);
                } else if order.is_terminal() {
                    frozen = Some(order.clone());
                }
            }
        }
    }
}
