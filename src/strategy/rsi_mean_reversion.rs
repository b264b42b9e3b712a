use serde_json::json;

use super::{MarketContext, Strategy};
use crate::error::PluginError;
use crate::indicators::{param_f64, param_usize, params, IndicatorRequest};
use crate::models::{Parameters, Signal, SignalAction};

pub const NAME: &str = "rsi_mean_reversion";

/// RSI mean reversion
///
/// Buys when RSI drops below `oversold`, sells when it rises above `overbought`.
/// Strength grows with the distance past the threshold.
///
/// Parameters:
/// - `rsi_length` (default 14, at least 2)
/// - `oversold` (default 30, within [5, 50))
/// - `overbought` (default 70, within (50, 95])
#[derive(Debug, Clone)]
pub struct RsiMeanReversionStrategy {
    rsi_length: usize,
    oversold: f64,
    overbought: f64,
}

impl RsiMeanReversionStrategy {
    pub fn from_parameters(parameters: &Parameters) -> Result<Self, PluginError> {
        let rsi_length = param_usize(NAME, parameters, "rsi_length", 14)?;
        let oversold = param_f64(NAME, parameters, "oversold", 30.0)?;
        let overbought = param_f64(NAME, parameters, "overbought", 70.0)?;

        if rsi_length < 2 {
            return Err(PluginError::invalid(NAME, "rsi_length must be at least 2"));
        }
        if !(5.0..50.0).contains(&oversold) {
            return Err(PluginError::invalid(NAME, "oversold must be within [5, 50)"));
        }
        if !(overbought > 50.0 && overbought <= 95.0) {
            return Err(PluginError::invalid(NAME, "overbought must be within (50, 95]"));
        }

        Ok(Self {
            rsi_length,
            oversold,
            overbought,
        })
    }
}

impl Strategy for RsiMeanReversionStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn required_indicators(&self) -> Vec<IndicatorRequest> {
        vec![IndicatorRequest::new(
            "rsi",
            "rsi",
            params([("length", json!(self.rsi_length))]),
        )]
    }

    fn min_candles_required(&self) -> usize {
        self.rsi_length + 1
    }

    fn generate_signal(&mut self, market: &MarketContext<'_>) -> Result<Signal, PluginError> {
        let rsi = market.latest("rsi")?;

        let (action, strength) = if rsi < self.oversold {
            (SignalAction::Buy, (self.oversold - rsi) / self.oversold)
        } else if rsi > self.overbought {
            (
                SignalAction::Sell,
                (rsi - self.overbought) / (100.0 - self.overbought),
            )
        } else {
            (SignalAction::Hold, 0.0)
        };

        if action != SignalAction::Hold {
            tracing::debug!(
                "{} {}: RSI {:.2} → {}",
                NAME,
                market.key,
                rsi,
                action
            );
        }

        Ok(Signal::new(action, strength, market.key).with_metadata(params([
            ("rsi", json!(rsi)),
            ("oversold", json!(self.oversold)),
            ("overbought", json!(self.overbought)),
        ])))
    }
}
