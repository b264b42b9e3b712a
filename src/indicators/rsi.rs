use super::{candle_closes, param_usize, Indicator, IndicatorSeries};
use crate::error::PluginError;
use crate::models::{Candle, Parameters};

/// Calculate Relative Strength Index (RSI) over the last `period` changes
///
/// RSI measures the magnitude of recent price changes to evaluate
/// overbought or oversold conditions.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let window = &prices[prices.len() - period - 1..];
    let (gain, loss) = window
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold((0.0, 0.0), |(g, l), change| {
            if change > 0.0 {
                (g + change, l)
            } else {
                (g, l - change)
            }
        });

    let avg_gain = gain / period as f64;
    let avg_loss = loss / period as f64;

    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

/// RSI at every index; `None` until `period + 1` prices are available.
pub fn rsi_series(prices: &[f64], period: usize) -> IndicatorSeries {
    (1..=prices.len())
        .map(|end| calculate_rsi(&prices[..end], period))
        .collect()
}

/// `rsi` plugin. Parameters: `length` (default 14, at least 2).
pub struct RsiIndicator;

impl Indicator for RsiIndicator {
    fn name(&self) -> &'static str {
        "rsi"
    }

    fn validate_parameters(&self, params: &Parameters) -> Result<(), PluginError> {
        let length = param_usize(self.name(), params, "length", 14)?;
        if length < 2 {
            return Err(PluginError::invalid(self.name(), "length must be at least 2"));
        }
        Ok(())
    }

    fn calculate(&self, candles: &[Candle], params: &Parameters) -> Result<IndicatorSeries, PluginError> {
        self.validate_parameters(params)?;
        let length = param_usize(self.name(), params, "length", 14)?;
        Ok(rsi_series(&candle_closes(candles), length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_calculation() {
        let prices = vec![
            44.0, 44.25, 44.5, 43.75, 44.0, 44.5, 45.0, 45.5, 45.25, 45.5, 46.0, 46.5, 46.25, 46.0,
            46.5,
        ];

        let rsi = calculate_rsi(&prices, 14).unwrap();
        assert!(rsi > 0.0 && rsi < 100.0);
    }

    #[test]
    fn test_rsi_insufficient_data() {
        assert!(calculate_rsi(&[100.0, 102.0, 101.0], 14).is_none());
    }

    #[test]
    fn test_rsi_all_gains() {
        let prices = vec![100.0, 101.0, 102.0, 103.0, 104.0, 105.0];
        assert_eq!(calculate_rsi(&prices, 5), Some(100.0));
    }

    #[test]
    fn test_rsi_all_losses_is_zero() {
        let prices = vec![105.0, 104.0, 103.0, 102.0, 101.0, 100.0];
        assert_eq!(calculate_rsi(&prices, 5), Some(0.0));
    }

    #[test]
    fn test_series_aligns_with_prices() {
        let prices = vec![1.0, 2.0, 3.0, 2.0, 1.0];
        let series = rsi_series(&prices, 2);
        assert_eq!(series.len(), prices.len());
        assert!(series[1].is_none());
        assert!(series[2].is_some());
    }

    #[test]
    fn test_length_is_validated() {
        let mut params = Parameters::new();
        params.insert("length".into(), 1.into());
        assert!(RsiIndicator.validate_parameters(&params).is_err());
    }
}
