use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{OrderSide, TradingKey};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn entry_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    pub fn exit_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    pub fn from_entry_side(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    EmergencyExit,
    Strategy,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::EmergencyExit => "emergency_exit",
            ExitReason::Strategy => "strategy",
            ExitReason::Manual => "manual",
        }
    }

    /// Exits raised by the risk sweep rather than by a strategy or an operator.
    pub fn is_risk_triggered(&self) -> bool {
        !matches!(self, ExitReason::Strategy | ExitReason::Manual)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop_loss" => Ok(ExitReason::StopLoss),
            "take_profit" => Ok(ExitReason::TakeProfit),
            "trailing_stop" => Ok(ExitReason::TrailingStop),
            "emergency_exit" => Ok(ExitReason::EmergencyExit),
            "strategy" => Ok(ExitReason::Strategy),
            "manual" => Ok(ExitReason::Manual),
            other => Err(format!("invalid exit reason '{}'", other)),
        }
    }
}

/// An exit that has been requested but not yet resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExit {
    pub reason: ExitReason,
    /// `None` closes the whole remaining quantity.
    pub quantity: Option<Decimal>,
    /// Set once the execution engine has created the exit order.
    pub order_id: Option<Uuid>,
    pub requested_at: DateTime<Utc>,
}

/// Position lifecycle as seen by the risk sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskState {
    Monitoring,
    ExitPending,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub pair: String,
    pub venue: String,
    pub strategy_id: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub initial_quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_order_id: Uuid,
    pub exit_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    /// Trailing distance in percent of the best price, once the trailing stop is armed.
    pub trailing_stop_distance: Option<Decimal>,
    pub trailing_stop_price: Option<Decimal>,
    /// Most favorable price seen since entry.
    pub best_price: Decimal,
    pub status: PositionStatus,
    pub pending_exit: Option<PendingExit>,
    pub exit_reason: Option<ExitReason>,
    pub partial_take_profit_done: bool,
    pub exit_failures: u32,
    pub requires_intervention: bool,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Decimal,
    pub realized_pnl_pct: Decimal,
}

impl Position {
    pub fn key(&self) -> TradingKey {
        TradingKey::new(&self.strategy_id, &self.pair, &self.venue)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn risk_state(&self) -> RiskState {
        match (self.status, &self.pending_exit) {
            (PositionStatus::Closed, _) => RiskState::Closed,
            (PositionStatus::Open, Some(_)) => RiskState::ExitPending,
            (PositionStatus::Open, None) => RiskState::Monitoring,
        }
    }

    /// Entry notional of the remaining quantity
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        pnl_for(self.side, self.entry_price, price, self.quantity)
    }

    /// Signed move from entry in percent, positive when the position is in profit.
    pub fn pnl_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        let change = match self.side {
            PositionSide::Long => price - self.entry_price,
            PositionSide::Short => self.entry_price - price,
        };
        change / self.entry_price * HUNDRED
    }

    /// Price is at least as favorable as `reference` for this side.
    pub fn is_favorable(&self, price: Decimal, reference: Decimal) -> bool {
        match self.side {
            PositionSide::Long => price >= reference,
            PositionSide::Short => price <= reference,
        }
    }

    /// Proposed (best_price, stop_price) after seeing `price`, or `None` when the stop would not move.
    ///
    /// The stop only ratchets in the position's favor; a retreating price never loosens it.
    pub fn trailing_update(
        &self,
        price: Decimal,
        trailing_pct: Decimal,
        activation_pct: Decimal,
    ) -> Option<(Decimal, Decimal)> {
        let armed = self.trailing_stop_price.is_some();
        if !armed && self.pnl_pct(price) < activation_pct {
            return None;
        }

        let best = if self.is_favorable(price, self.best_price) {
            price
        } else {
            self.best_price
        };
        let offset = best * trailing_pct / HUNDRED;
        let stop = match self.side {
            PositionSide::Long => best - offset,
            PositionSide::Short => best + offset,
        };

        match self.trailing_stop_price {
            Some(current) if !self.is_favorable(stop, current) || stop == current => None,
            _ => Some((best, stop)),
        }
    }

    pub fn trailing_stop_hit(&self, price: Decimal) -> bool {
        match (self.trailing_stop_price, self.side) {
            (Some(stop), PositionSide::Long) => price <= stop,
            (Some(stop), PositionSide::Short) => price >= stop,
            (None, _) => false,
        }
    }
}

pub fn pnl_for(side: PositionSide, entry: Decimal, exit: Decimal, quantity: Decimal) -> Decimal {
    match side {
        PositionSide::Long => (exit - entry) * quantity,
        PositionSide::Short => (entry - exit) * quantity,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    pub(crate) fn open_position(side: PositionSide, entry: Decimal, quantity: Decimal) -> Position {
        let now = Utc::now();
        Position {
            id: Uuid::new_v4(),
            pair: "BTC/USDT".to_string(),
            venue: "paper".to_string(),
            strategy_id: "s1".to_string(),
            side,
            quantity,
            initial_quantity: quantity,
            entry_price: entry,
            entry_order_id: Uuid::new_v4(),
            exit_price: None,
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_distance: None,
            trailing_stop_price: None,
            best_price: entry,
            status: PositionStatus::Open,
            pending_exit: None,
            exit_reason: None,
            partial_take_profit_done: false,
            exit_failures: 0,
            requires_intervention: false,
            opened_at: now,
            updated_at: now,
            closed_at: None,
            realized_pnl: Decimal::ZERO,
            realized_pnl_pct: Decimal::ZERO,
        }
    }

    #[test]
    fn test_pnl_pct_is_side_aware() {
        let long = open_position(PositionSide::Long, dec!(100), dec!(1));
        assert_eq!(long.pnl_pct(dec!(97.9)), dec!(-2.1));
        assert_eq!(long.pnl_pct(dec!(110)), dec!(10));

        let short = open_position(PositionSide::Short, dec!(100), dec!(1));
        assert_eq!(short.pnl_pct(dec!(97.9)), dec!(2.1));
        assert_eq!(short.unrealized_pnl(dec!(110)), dec!(-10));
    }

    #[test]
    fn test_trailing_not_armed_below_activation() {
        let position = open_position(PositionSide::Long, dec!(100), dec!(1));
        assert!(position.trailing_update(dec!(104), dec!(2), dec!(5)).is_none());
    }

    #[test]
    fn test_trailing_arms_and_ratchets() {
        let mut position = open_position(PositionSide::Long, dec!(100), dec!(1));

        let (best, stop) = position.trailing_update(dec!(110), dec!(5), dec!(8)).unwrap();
        assert_eq!(best, dec!(110));
        assert_eq!(stop, dec!(104.5));
        position.best_price = best;
        position.trailing_stop_price = Some(stop);

        // Price retreats: stop stays put
        assert!(position.trailing_update(dec!(106), dec!(5), dec!(8)).is_none());
        assert!(!position.trailing_stop_hit(dec!(106)));
        assert!(position.trailing_stop_hit(dec!(104.5)));

        let (_, higher) = position.trailing_update(dec!(120), dec!(5), dec!(8)).unwrap();
        assert_eq!(higher, dec!(114));
    }

    #[test]
    fn test_short_trailing_moves_down() {
        let mut position = open_position(PositionSide::Short, dec!(100), dec!(1));
        let (best, stop) = position.trailing_update(dec!(90), dec!(5), dec!(8)).unwrap();
        assert_eq!(best, dec!(90));
        assert_eq!(stop, dec!(94.5));
        position.best_price = best;
        position.trailing_stop_price = Some(stop);
        assert!(position.trailing_stop_hit(dec!(95)));
    }

    #[test]
    fn test_risk_state() {
        let mut position = open_position(PositionSide::Long, dec!(100), dec!(1));
        assert_eq!(position.risk_state(), RiskState::Monitoring);
        position.pending_exit = Some(PendingExit {
            reason: ExitReason::StopLoss,
            quantity: None,
            order_id: None,
            requested_at: Utc::now(),
        });
        assert_eq!(position.risk_state(), RiskState::ExitPending);
        position.status = PositionStatus::Closed;
        assert_eq!(position.risk_state(), RiskState::Closed);
    }

    proptest! {
        #[test]
        fn prop_trailing_stop_never_worsens(prices in prop::collection::vec(50u32..200, 1..60)) {
            let mut position = open_position(PositionSide::Long, dec!(100), dec!(1));
            let mut last_stop: Option<Decimal> = None;
            for p in prices {
                if let Some((best, stop)) = position.trailing_update(Decimal::from(p), dec!(3), dec!(5)) {
                    position.best_price = best;
                    position.trailing_stop_price = Some(stop);
                }
                if let (Some(prev), Some(now)) = (last_stop, position.trailing_stop_price) {
                    prop_assert!(now >= prev);
                }
                last_stop = position.trailing_stop_price;
            }
        }
    }
}
