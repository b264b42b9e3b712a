use chrono::{DateTime, Utc};
use serde_json::json;

use super::{MarketContext, Strategy};
use crate::error::PluginError;
use crate::indicators::{param_usize, params, IndicatorRequest};
use crate::models::{Parameters, Signal, SignalAction};

pub const NAME: &str = "macd_crossover";

/// MACD / signal line crossover
///
/// Buys when the MACD line crosses above its signal line and sells on the bearish cross.
/// Crosses are full-conviction signals. Like the moving average crossover, a candle
/// produces at most one directional signal.
///
/// Parameters:
/// - `fast` (default 12), `slow` (default 26), `signal` (default 9); `fast < slow`
/// - `allow_short` (default false): a bearish cross is tagged as a short entry instead of a long exit
#[derive(Debug, Clone)]
pub struct MacdCrossoverStrategy {
    fast: usize,
    slow: usize,
    signal: usize,
    allow_short: bool,
    last_signal_candle: Option<DateTime<Utc>>,
}

impl MacdCrossoverStrategy {
    pub fn from_parameters(parameters: &Parameters) -> Result<Self, PluginError> {
        let fast = param_usize(NAME, parameters, "fast", 12)?;
        let slow = param_usize(NAME, parameters, "slow", 26)?;
        let signal = param_usize(NAME, parameters, "signal", 9)?;
        let allow_short = match parameters.get("allow_short") {
            None => false,
            Some(v) => v
                .as_bool()
                .ok_or_else(|| PluginError::invalid(NAME, "allow_short must be a boolean"))?,
        };

        if fast == 0 || signal == 0 {
            return Err(PluginError::invalid(NAME, "fast and signal must be positive"));
        }
        if fast >= slow {
            return Err(PluginError::invalid(NAME, "fast must be shorter than slow"));
        }

        Ok(Self {
            fast,
            slow,
            signal,
            allow_short,
            last_signal_candle: None,
        })
    }

    fn line(&self, line: &str) -> IndicatorRequest {
        IndicatorRequest::new(
            line,
            "macd",
            params([
                ("fast", json!(self.fast)),
                ("slow", json!(self.slow)),
                ("signal", json!(self.signal)),
                ("line", json!(line)),
            ]),
        )
    }
}

impl Strategy for MacdCrossoverStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn required_indicators(&self) -> Vec<IndicatorRequest> {
        vec![self.line("macd"), self.line("signal")]
    }

    fn min_candles_required(&self) -> usize {
        // Two defined signal-line values to see a cross
        self.slow + self.signal
    }

    fn generate_signal(&mut self, market: &MarketContext<'_>) -> Result<Signal, PluginError> {
        let macd = market.latest("macd")?;
        let signal = market.latest("signal")?;
        let prev_macd = market.previous("macd")?;
        let prev_signal = market.previous("signal")?;

        let (action, reason) = if prev_macd >= prev_signal && macd < signal {
            let reason = if self.allow_short {
                "bearish_cross_short_entry"
            } else {
                "bearish_cross_long_exit"
            };
            (SignalAction::Sell, reason)
        } else if prev_macd <= prev_signal && macd > signal {
            (SignalAction::Buy, "bullish_cross_long_entry")
        } else {
            (SignalAction::Hold, "no_cross")
        };

        let candle = market.candles.last().map(|c| c.timestamp);
        let (action, reason) =
            if action != SignalAction::Hold && candle.is_some() && candle == self.last_signal_candle {
                (SignalAction::Hold, "already_signalled")
            } else {
                (action, reason)
            };
        if action != SignalAction::Hold {
            self.last_signal_candle = candle;
        }

        let strength = if action == SignalAction::Hold { 0.0 } else { 1.0 };
        Ok(Signal::new(action, strength, market.key).with_metadata(params([
            ("macd", json!(macd)),
            ("signal", json!(signal)),
            ("fast", json!(self.fast)),
            ("slow", json!(self.slow)),
            ("signal_len", json!(self.signal)),
            ("allow_short", json!(self.allow_short)),
            ("reason", json!(reason)),
        ])))
    }

    fn reset_state(&mut self) {
        self.last_signal_candle = None;
    }
}
