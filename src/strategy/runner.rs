use std::sync::Arc;

use super::{MarketContext, Strategy};
use crate::error::PluginError;
use crate::indicators::{IndicatorCache, IndicatorRegistry, IndicatorRequest, IndicatorValues};
use crate::models::{Candle, Signal, Timeframe, TradingKey};

/// One strategy instance bound to its (strategy, pair, timeframe, venue) tuple.
pub struct StrategyRunner {
    key: TradingKey,
    timeframe: Timeframe,
    strategy: Box<dyn Strategy>,
    requests: Vec<IndicatorRequest>,
    indicators: Arc<IndicatorRegistry>,
    cache: Arc<IndicatorCache>,
}

impl StrategyRunner {
    /// Fails if the strategy asks for an indicator that is not registered or mis-parameterised.
    pub fn new(
        key: TradingKey,
        timeframe: Timeframe,
        strategy: Box<dyn Strategy>,
        indicators: Arc<IndicatorRegistry>,
        cache: Arc<IndicatorCache>,
    ) -> Result<Self, PluginError> {
        let requests = strategy.required_indicators();
        for request in &requests {
            indicators.validate(request)?;
        }
        Ok(Self {
            key,
            timeframe,
            strategy,
            requests,
            indicators,
            cache,
        })
    }

    pub fn key(&self) -> &TradingKey {
        &self.key
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn min_candles(&self) -> usize {
        self.strategy.min_candles_required()
    }

    /// Compute the requested indicators and ask the strategy for a signal.
    pub fn evaluate(&mut self, candles: &[Candle]) -> Result<Signal, PluginError> {
        let needed = self.strategy.min_candles_required();
        if candles.len() < needed {
            return Err(PluginError::InsufficientData {
                needed,
                got: candles.len(),
            });
        }

        let mut values = IndicatorValues::with_capacity(self.requests.len());
        for request in &self.requests {
            let indicator = self.indicators.get(&request.indicator)?;
            let series = self.cache.get_or_compute(
                &self.key.pair,
                self.timeframe,
                indicator.as_ref(),
                candles,
                &request.parameters,
            )?;
            values.insert(request.key.clone(), series);
        }

        let market = MarketContext {
            key: &self.key,
            candles,
            indicators: &values,
        };
        let mut signal = self.strategy.generate_signal(&market)?;

        // The tuple owns the key, whatever the plugin filled in
        signal.strategy_id = self.key.strategy_id.clone();
        signal.pair = self.key.pair.clone();
        signal.venue = self.key.venue.clone();
        Ok(signal)
    }

    pub fn reset(&mut self) {
        self.strategy.reset_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Parameters, SignalAction};
    use crate::strategy::StrategyRegistry;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    fn falling(n: usize) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let close = Decimal::from(200 - i as i64);
                Candle {
                    timestamp: start + Duration::hours(i as i64),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: Decimal::ONE,
                }
            })
            .collect()
    }

    fn runner() -> StrategyRunner {
        let strategy = StrategyRegistry::with_builtin()
            .create("rsi_mean_reversion", &Parameters::new())
            .unwrap();
        StrategyRunner::new(
            TradingKey::new("rsi-btc", "BTC/USDT", "paper"),
            Timeframe::H1,
            strategy,
            Arc::new(IndicatorRegistry::with_builtin()),
            Arc::new(IndicatorCache::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_steady_decline_is_oversold() {
        let mut runner = runner();
        let signal = runner.evaluate(&falling(40)).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.key(), *runner.key());
    }

    #[test]
    fn test_short_history_is_rejected() {
        let mut runner = runner();
        let err = runner.evaluate(&falling(5)).unwrap_err();
        assert!(matches!(err, PluginError::InsufficientData { needed: 15, got: 5 }));
    }
}
