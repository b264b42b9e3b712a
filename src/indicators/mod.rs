// Technical indicator plugins, their registry and the shared result cache

pub mod cache;
pub mod macd;
pub mod moving_average;
pub mod rsi;

pub use cache::{CacheStats, IndicatorCache};
pub use macd::{macd_series, MacdIndicator};
pub use moving_average::{calculate_ema, calculate_sma, EmaIndicator, SmaIndicator};
pub use rsi::{calculate_rsi, RsiIndicator};

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PluginError;
use crate::models::{Candle, Parameters};

/// One value per input candle; `None` during warm-up.
pub type IndicatorSeries = Vec<Option<f64>>;

/// Indicator outputs handed to a strategy, keyed by the name the strategy asked for.
pub type IndicatorValues = HashMap<String, Arc<IndicatorSeries>>;

/// Pure function of a candle series and its parameters.
pub trait Indicator: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate_parameters(&self, params: &Parameters) -> Result<(), PluginError>;

    fn calculate(&self, candles: &[Candle], params: &Parameters) -> Result<IndicatorSeries, PluginError>;
}

/// An indicator a strategy needs, stored under `key` in [`IndicatorValues`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRequest {
    pub key: String,
    pub indicator: String,
    pub parameters: Parameters,
}

impl IndicatorRequest {
    pub fn new(key: impl Into<String>, indicator: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            key: key.into(),
            indicator: indicator.into(),
            parameters,
        }
    }
}

/// Indicators by name, filled by explicit registration at startup.
#[derive(Clone, Default)]
pub struct IndicatorRegistry {
    indicators: HashMap<String, Arc<dyn Indicator>>,
}

impl IndicatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `rsi`, `sma`, `ema` and `macd`
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RsiIndicator));
        registry.register(Arc::new(SmaIndicator));
        registry.register(Arc::new(EmaIndicator));
        registry.register(Arc::new(MacdIndicator));
        registry
    }

    pub fn register(&mut self, indicator: Arc<dyn Indicator>) {
        self.indicators.insert(indicator.name().to_string(), indicator);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Indicator>, PluginError> {
        self.indicators
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::UnknownIndicator(name.to_string()))
    }

    pub fn validate(&self, request: &IndicatorRequest) -> Result<(), PluginError> {
        self.get(&request.indicator)?
            .validate_parameters(&request.parameters)
    }
}

pub(crate) fn candle_closes(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .map(|c| c.close.to_f64().unwrap_or(f64::NAN))
        .collect()
}

pub(crate) fn param_usize(
    plugin: &str,
    params: &Parameters,
    key: &str,
    default: usize,
) -> Result<usize, PluginError> {
    match params.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| PluginError::invalid(plugin, format!("{} must be a non-negative integer", key))),
    }
}

pub(crate) fn param_f64(
    plugin: &str,
    params: &Parameters,
    key: &str,
    default: f64,
) -> Result<f64, PluginError> {
    match params.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| PluginError::invalid(plugin, format!("{} must be a number", key))),
    }
}

/// Build a parameter map from `(key, value)` pairs.
pub fn params<const N: usize>(pairs: [(&str, serde_json::Value); N]) -> Parameters {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_registry() {
        let registry = IndicatorRegistry::with_builtin();
        assert!(registry.get("rsi").is_ok());
        assert!(registry.get("ema").is_ok());
        assert!(registry.get("macd").is_ok());
        assert!(matches!(
            registry.get("bollinger"),
            Err(PluginError::UnknownIndicator(_))
        ));
    }

    #[test]
    fn test_parameter_types_are_checked() {
        let bad = params([("length", json!("fourteen"))]);
        assert!(param_usize("rsi", &bad, "length", 14).is_err());
        assert_eq!(param_usize("rsi", &Parameters::new(), "length", 14).unwrap(), 14);
        assert_eq!(param_f64("x", &params([("k", json!(2.5))]), "k", 0.0).unwrap(), 2.5);
    }
}
