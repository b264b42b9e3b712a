use chrono::{DateTime, Utc};
use serde_json::json;

use super::{MarketContext, Strategy};
use crate::error::PluginError;
use crate::indicators::{param_usize, params, IndicatorRequest};
use crate::models::{Parameters, Signal, SignalAction};

pub const NAME: &str = "ma_crossover";

/// Moving average crossover
///
/// Buys when the fast average crosses above the slow one, sells on the opposite cross.
/// Emits at most one directional signal per candle: a forced re-evaluation of the same
/// candle holds.
#[derive(Debug, Clone)]
pub struct MaCrossoverStrategy {
    fast: usize,
    slow: usize,
    /// `sma` or `ema`
    kind: String,
    last_signal_candle: Option<DateTime<Utc>>,
}

impl MaCrossoverStrategy {
    pub fn from_parameters(parameters: &Parameters) -> Result<Self, PluginError> {
        let fast = param_usize(NAME, parameters, "fast", 10)?;
        let slow = param_usize(NAME, parameters, "slow", 30)?;
        let kind = match parameters.get("kind") {
            None => "ema".to_string(),
            Some(v) => v
                .as_str()
                .filter(|k| matches!(*k, "sma" | "ema"))
                .ok_or_else(|| PluginError::invalid(NAME, "kind must be \"sma\" or \"ema\""))?
                .to_string(),
        };

        if fast == 0 {
            return Err(PluginError::invalid(NAME, "fast must be positive"));
        }
        if fast >= slow {
            return Err(PluginError::invalid(NAME, "fast must be shorter than slow"));
        }

        Ok(Self {
            fast,
            slow,
            kind,
            last_signal_candle: None,
        })
    }
}

impl Strategy for MaCrossoverStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn required_indicators(&self) -> Vec<IndicatorRequest> {
        vec![
            IndicatorRequest::new("fast", &self.kind, params([("length", json!(self.fast))])),
            IndicatorRequest::new("slow", &self.kind, params([("length", json!(self.slow))])),
        ]
    }

    fn min_candles_required(&self) -> usize {
        self.slow + 1
    }

    fn generate_signal(&mut self, market: &MarketContext<'_>) -> Result<Signal, PluginError> {
        let fast = market.latest("fast")?;
        let slow = market.latest("slow")?;
        let prev_fast = market.previous("fast")?;
        let prev_slow = market.previous("slow")?;

        let action = if prev_fast <= prev_slow && fast > slow {
            SignalAction::Buy
        } else if prev_fast >= prev_slow && fast < slow {
            SignalAction::Sell
        } else {
            SignalAction::Hold
        };

        let candle = market.candles.last().map(|c| c.timestamp);
        let action = if action != SignalAction::Hold && candle.is_some() && candle == self.last_signal_candle {
            SignalAction::Hold
        } else {
            action
        };
        if action != SignalAction::Hold {
            self.last_signal_candle = candle;
        }

        let spread = if slow != 0.0 { (fast - slow).abs() / slow } else { 0.0 };
        // 2% separation counts as full conviction
        let strength = if action == SignalAction::Hold {
            0.0
        } else {
            spread / 0.02
        };

        Ok(Signal::new(action, strength, market.key).with_metadata(params([
            ("fast", json!(fast)),
            ("slow", json!(slow)),
            ("kind", json!(self.kind)),
        ])))
    }

    fn reset_state(&mut self) {
        self.last_signal_candle = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorValues;
    use crate::models::{Candle, TradingKey};
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn values(fast: [f64; 2], slow: [f64; 2]) -> IndicatorValues {
        let mut values = IndicatorValues::new();
        values.insert("fast".into(), Arc::new(vec![Some(fast[0]), Some(fast[1])]));
        values.insert("slow".into(), Arc::new(vec![Some(slow[0]), Some(slow[1])]));
        values
    }

    fn candle() -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            open: Decimal::ONE,
            high: Decimal::ONE,
            low: Decimal::ONE,
            close: Decimal::ONE,
            volume: Decimal::ONE,
        }
    }

    #[test]
    fn test_golden_cross_buys_once_per_candle() {
        let key = TradingKey::new("ma-1", "ETH/USDT", "paper");
        let values = values([99.0, 101.0], [100.0, 100.0]);
        let candles = [candle()];
        let market = MarketContext {
            key: &key,
            candles: &candles,
            indicators: &values,
        };
        let mut strategy = MaCrossoverStrategy::from_parameters(&Parameters::new()).unwrap();

        assert_eq!(strategy.generate_signal(&market).unwrap().action, SignalAction::Buy);
        assert!(strategy.generate_signal(&market).unwrap().is_hold());

        strategy.reset_state();
        assert_eq!(strategy.generate_signal(&market).unwrap().action, SignalAction::Buy);
    }

    #[test]
    fn test_death_cross_sells() {
        let key = TradingKey::new("ma-1", "ETH/USDT", "paper");
        let values = values([101.0, 99.0], [100.0, 100.0]);
        let market = MarketContext {
            key: &key,
            candles: &[],
            indicators: &values,
        };
        let mut strategy = MaCrossoverStrategy::from_parameters(&Parameters::new()).unwrap();
        let signal = strategy.generate_signal(&market).unwrap();
        assert_eq!(signal.action, SignalAction::Sell);
        assert!((signal.strength - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_fast_must_be_shorter() {
        let bad = params([("fast", json!(30)), ("slow", json!(30))]);
        assert!(MaCrossoverStrategy::from_parameters(&bad).is_err());
        let bad_kind = params([("kind", json!("wma"))]);
        assert!(MaCrossoverStrategy::from_parameters(&bad_kind).is_err());
    }
}
