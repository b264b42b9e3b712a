// Trading strategy plugins, their registry, and the per-tuple runner
pub mod ma_crossover;
pub mod macd_crossover;
pub mod rsi_mean_reversion;
pub mod runner;

pub use ma_crossover::MaCrossoverStrategy;
pub use macd_crossover::MacdCrossoverStrategy;
pub use rsi_mean_reversion::RsiMeanReversionStrategy;
pub use runner::StrategyRunner;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PluginError;
use crate::indicators::{IndicatorRequest, IndicatorSeries, IndicatorValues};
use crate::models::{Candle, Parameters, Signal, TradingKey};

/// Everything a strategy sees on one tick.
pub struct MarketContext<'a> {
    pub key: &'a TradingKey,
    pub candles: &'a [Candle],
    pub indicators: &'a IndicatorValues,
}

impl<'a> MarketContext<'a> {
    /// The indicator requested under `key`.
    pub fn indicator(&self, key: &str) -> Result<&'a IndicatorSeries, PluginError> {
        self.indicators
            .get(key)
            .map(|series| series.as_ref())
            .ok_or_else(|| PluginError::MissingIndicator(key.to_string()))
    }

    /// Latest value of an indicator; errors while it is still warming up.
    pub fn latest(&self, key: &str) -> Result<f64, PluginError> {
        self.indicator(key)?
            .last()
            .copied()
            .flatten()
            .ok_or_else(|| PluginError::MissingIndicator(key.to_string()))
    }

    /// Value one candle before the latest.
    pub fn previous(&self, key: &str) -> Result<f64, PluginError> {
        let series = self.indicator(key)?;
        series
            .len()
            .checked_sub(2)
            .and_then(|i| series[i])
            .ok_or_else(|| PluginError::MissingIndicator(key.to_string()))
    }
}

/// Base trait for all trading strategies
///
/// Strategies are built from validated parameters by their registry factory. Any state a
/// strategy keeps between ticks must be cleared by `reset_state`.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Indicators the runner computes before every `generate_signal` call
    fn required_indicators(&self) -> Vec<IndicatorRequest>;

    /// Minimum candles required for this strategy
    fn min_candles_required(&self) -> usize;

    fn generate_signal(&mut self, market: &MarketContext<'_>) -> Result<Signal, PluginError>;

    fn reset_state(&mut self) {}
}

pub type StrategyFactory = fn(&Parameters) -> Result<Box<dyn Strategy>, PluginError>;

/// Strategy factories by name, filled by explicit registration at startup.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `rsi_mean_reversion`, `macd_crossover` and `ma_crossover`
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(rsi_mean_reversion::NAME, build_rsi_mean_reversion);
        registry.register(macd_crossover::NAME, build_macd_crossover);
        registry.register(ma_crossover::NAME, build_ma_crossover);
        registry
    }

    pub fn register(&mut self, name: &str, factory: StrategyFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build a fresh instance; parameters are validated by the factory.
    pub fn create(&self, name: &str, parameters: &Parameters) -> Result<Box<dyn Strategy>, PluginError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PluginError::UnknownStrategy(name.to_string()))?;
        factory(parameters)
    }

    pub fn validate_parameters(&self, name: &str, parameters: &Parameters) -> Result<(), PluginError> {
        self.create(name, parameters).map(|_| ())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

fn build_rsi_mean_reversion(parameters: &Parameters) -> Result<Box<dyn Strategy>, PluginError> {
    Ok(Box::new(RsiMeanReversionStrategy::from_parameters(parameters)?))
}

fn build_macd_crossover(parameters: &Parameters) -> Result<Box<dyn Strategy>, PluginError> {
    Ok(Box::new(MacdCrossoverStrategy::from_parameters(parameters)?))
}

fn build_ma_crossover(parameters: &Parameters) -> Result<Box<dyn Strategy>, PluginError> {
    Ok(Box::new(MaCrossoverStrategy::from_parameters(parameters)?))
}

/// Shared handle used by the orchestrator and config validation.
pub type SharedStrategyRegistry = Arc<StrategyRegistry>;
