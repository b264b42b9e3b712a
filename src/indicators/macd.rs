use super::moving_average::ema_series;
use super::{candle_closes, param_usize, Indicator, IndicatorSeries};
use crate::error::PluginError;
use crate::models::{Candle, Parameters};

/// MACD line and its signal line, aligned with the input prices.
///
/// The MACD line is `EMA(fast) - EMA(slow)`; the signal line is an EMA of the MACD line,
/// defined once `signal` MACD values exist.
pub fn macd_series(
    prices: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (IndicatorSeries, IndicatorSeries) {
    let fast_ema = ema_series(prices, fast);
    let slow_ema = ema_series(prices, slow);
    let macd: IndicatorSeries = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| Some((*f)? - (*s)?))
        .collect();

    let mut signal_line = vec![None; prices.len()];
    if let Some(start) = macd.iter().position(Option::is_some) {
        let defined: Vec<f64> = macd[start..].iter().map(|v| v.unwrap_or(f64::NAN)).collect();
        for (offset, value) in ema_series(&defined, signal).into_iter().enumerate() {
            signal_line[start + offset] = value;
        }
    }
    (macd, signal_line)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MacdLine {
    Macd,
    Signal,
    Histogram,
}

struct MacdParams {
    fast: usize,
    slow: usize,
    signal: usize,
    line: MacdLine,
}

fn parse(plugin: &'static str, params: &Parameters) -> Result<MacdParams, PluginError> {
    let fast = param_usize(plugin, params, "fast", 12)?;
    let slow = param_usize(plugin, params, "slow", 26)?;
    let signal = param_usize(plugin, params, "signal", 9)?;
    if fast == 0 || slow == 0 || signal == 0 {
        return Err(PluginError::invalid(plugin, "fast, slow and signal must be positive"));
    }
    if fast >= slow {
        return Err(PluginError::invalid(plugin, "fast must be shorter than slow"));
    }
    let line = match params.get("line").map(|v| v.as_str()) {
        None | Some(Some("macd")) => MacdLine::Macd,
        Some(Some("signal")) => MacdLine::Signal,
        Some(Some("histogram")) => MacdLine::Histogram,
        _ => {
            return Err(PluginError::invalid(
                plugin,
                "line must be \"macd\", \"signal\" or \"histogram\"",
            ))
        }
    };
    Ok(MacdParams {
        fast,
        slow,
        signal,
        line,
    })
}

/// `macd` plugin. Parameters: `fast` (default 12), `slow` (default 26), `signal` (default 9)
/// and `line`, one of `macd` (default), `signal` or `histogram`.
pub struct MacdIndicator;

impl Indicator for MacdIndicator {
    fn name(&self) -> &'static str {
        "macd"
    }

    fn validate_parameters(&self, params: &Parameters) -> Result<(), PluginError> {
        parse(self.name(), params).map(|_| ())
    }

    fn calculate(&self, candles: &[Candle], params: &Parameters) -> Result<IndicatorSeries, PluginError> {
        let p = parse(self.name(), params)?;
        let (macd, signal) = macd_series(&candle_closes(candles), p.fast, p.slow, p.signal);
        Ok(match p.line {
            MacdLine::Macd => macd,
            MacdLine::Signal => signal,
            MacdLine::Histogram => macd
                .iter()
                .zip(&signal)
                .map(|(m, s)| Some((*m)? - (*s)?))
                .collect(),
        })
    }
}
