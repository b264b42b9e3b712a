use super::{candle_closes, param_usize, Indicator, IndicatorSeries};
use crate::error::PluginError;
use crate::models::{Candle, Parameters};

/// Calculate Simple Moving Average (SMA)
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Calculate Exponential Moving Average (EMA), seeded with the SMA of the first `period` prices
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    ema_series(prices, period).last().copied().flatten()
}

pub fn sma_series(prices: &[f64], period: usize) -> IndicatorSeries {
    (1..=prices.len())
        .map(|end| calculate_sma(&prices[..end], period))
        .collect()
}

pub fn ema_series(prices: &[f64], period: usize) -> IndicatorSeries {
    let mut series = vec![None; prices.len()];
    if period == 0 || prices.len() < period {
        return series;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = prices[..period].iter().sum::<f64>() / period as f64;
    series[period - 1] = Some(ema);

    for (i, price) in prices.iter().enumerate().skip(period) {
        ema = (price - ema) * multiplier + ema;
        series[i] = Some(ema);
    }
    series
}

fn validate_length(plugin: &'static str, params: &Parameters) -> Result<usize, PluginError> {
    let length = param_usize(plugin, params, "length", 20)?;
    if length == 0 {
        return Err(PluginError::invalid(plugin, "length must be positive"));
    }
    Ok(length)
}

/// `sma` plugin. Parameters: `length` (default 20).
pub struct SmaIndicator;

impl Indicator for SmaIndicator {
    fn name(&self) -> &'static str {
        "sma"
    }

    fn validate_parameters(&self, params: &Parameters) -> Result<(), PluginError> {
        validate_length(self.name(), params).map(|_| ())
    }

    fn calculate(&self, candles: &[Candle], params: &Parameters) -> Result<IndicatorSeries, PluginError> {
        let length = validate_length(self.name(), params)?;
        Ok(sma_series(&candle_closes(candles), length))
    }
}

/// `ema` plugin. Parameters: `length` (default 20).
pub struct EmaIndicator;

impl Indicator for EmaIndicator {
    fn name(&self) -> &'static str {
        "ema"
    }

    fn validate_parameters(&self, params: &Parameters) -> Result<(), PluginError> {
        validate_length(self.name(), params).map(|_| ())
    }

    fn calculate(&self, candles: &[Candle], params: &Parameters) -> Result<IndicatorSeries, PluginError> {
        let length = validate_length(self.name(), params)?;
        Ok(ema_series(&candle_closes(candles), length))
    }
}
