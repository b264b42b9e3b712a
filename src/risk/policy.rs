use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopLossConfig {
    pub enabled: bool,
    /// Loss from entry in percent that triggers a market exit
    pub percentage: Decimal,
    pub cooldown_secs: u64,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            percentage: Decimal::new(2, 0),
            cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TakeProfitConfig {
    pub enabled: bool,
    pub percentage: Decimal,
    pub cooldown_secs: u64,
    /// Close only this percentage of the position; fires once per position
    pub partial_close_pct: Option<Decimal>,
}

impl Default for TakeProfitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            percentage: Decimal::new(5, 0),
            cooldown_secs: 60,
            partial_close_pct: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingStopConfig {
    pub enabled: bool,
    /// Distance of the stop from the best price, in percent
    pub trailing_pct: Decimal,
    /// Unrealized gain in percent that arms the trailing stop
    pub activation_pct: Decimal,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trailing_pct: Decimal::new(15, 1),
            activation_pct: Decimal::new(3, 0),
        }
    }
}

/// Caps on open entry notional, in `base_currency`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    pub max_per_asset: Decimal,
    pub max_per_exchange: Decimal,
    pub max_total: Decimal,
    pub base_currency: String,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            max_per_asset: Decimal::new(2_500, 0),
            max_per_exchange: Decimal::new(5_000, 0),
            max_total: Decimal::new(10_000, 0),
            base_currency: "USDT".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrawdownConfig {
    pub max_drawdown_pct: Decimal,
    pub emergency_exit_enabled: bool,
    pub emergency_exit_pct: Decimal,
    /// Enter emergency-only mode when max_drawdown_pct is breached
    pub pause_on_breach: bool,
    pub calculation_period_days: u32,
}

impl Default for DrawdownConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: Decimal::new(15, 0),
            emergency_exit_enabled: true,
            emergency_exit_pct: Decimal::new(20, 0),
            pause_on_breach: true,
            calculation_period_days: 30,
        }
    }
}

/// Immutable risk configuration snapshot. All percentages are in percent units (2.0 = 2%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskPolicy {
    pub stop_loss: StopLossConfig,
    pub take_profit: TakeProfitConfig,
    pub trailing_stop: TrailingStopConfig,
    pub exposure: ExposureConfig,
    pub drawdown: DrawdownConfig,
    /// Entry size as a percentage of equity, unless the signal carries a quantity
    pub max_position_size_pct: Decimal,
    pub max_concurrent_trades: usize,
    pub max_per_asset_trades: usize,
    pub risk_check_interval_secs: u64,
    /// Cap for cooldowns grown by failed exit rounds
    pub max_cooldown_secs: u64,
    /// Open short positions on sell signals when flat
    pub allow_short: bool,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            stop_loss: StopLossConfig::default(),
            take_profit: TakeProfitConfig::default(),
            trailing_stop: TrailingStopConfig::default(),
            exposure: ExposureConfig::default(),
            drawdown: DrawdownConfig::default(),
            max_position_size_pct: Decimal::new(10, 0),
            max_concurrent_trades: 5,
            max_per_asset_trades: 1,
            risk_check_interval_secs: 30,
            max_cooldown_secs: 3_600,
            allow_short: false,
        }
    }
}

fn check_pct(name: &str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO || value > Decimal::ONE_HUNDRED {
        return Err(ConfigError::Invalid(format!(
            "{} must be within (0, 100], got {}",
            name, value
        )));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

impl RiskPolicy {
    pub fn stop_loss_pct(&self) -> Decimal {
        self.stop_loss.percentage
    }

    pub fn take_profit_pct(&self) -> Decimal {
        self.take_profit.percentage
    }

    pub fn trailing_stop_pct(&self) -> Decimal {
        self.trailing_stop.trailing_pct
    }

    pub fn trailing_activation_pct(&self) -> Decimal {
        self.trailing_stop.activation_pct
    }

    pub fn risk_check_interval(&self) -> Duration {
        Duration::from_secs(self.risk_check_interval_secs)
    }

    /// Cooldown after a rule fired, doubled for every failed exit round, capped.
    pub fn cooldown(&self, base_secs: u64, exit_failures: u32) -> Duration {
        let factor = 2u64.saturating_pow(exit_failures.min(32));
        Duration::from_secs(base_secs.saturating_mul(factor).min(self.max_cooldown_secs.max(base_secs)))
    }

    /// Enforce every invariant; any violation is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stop_loss.enabled {
            check_pct("stop_loss.percentage", self.stop_loss.percentage)?;
        }
        if self.take_profit.enabled {
            check_pct("take_profit.percentage", self.take_profit.percentage)?;
            if let Some(partial) = self.take_profit.partial_close_pct {
                check_pct("take_profit.partial_close_pct", partial)?;
            }
        }
        if self.stop_loss.enabled
            && self.take_profit.enabled
            && self.stop_loss.percentage >= self.take_profit.percentage
        {
            return Err(invalid("stop_loss.percentage must be below take_profit.percentage"));
        }

        if self.trailing_stop.enabled {
            check_pct("trailing_stop.trailing_pct", self.trailing_stop.trailing_pct)?;
            check_pct("trailing_stop.activation_pct", self.trailing_stop.activation_pct)?;
            if self.trailing_stop.activation_pct <= self.trailing_stop.trailing_pct {
                return Err(invalid(
                    "trailing_stop.activation_pct must be greater than trailing_stop.trailing_pct",
                ));
            }
        }

        let exposure = &self.exposure;
        if exposure.max_per_asset <= Decimal::ZERO {
            return Err(invalid("exposure.max_per_asset must be positive"));
        }
        if exposure.max_per_asset > exposure.max_per_exchange
            || exposure.max_per_exchange > exposure.max_total
        {
            return Err(invalid(
                "exposure limits must satisfy max_per_asset <= max_per_exchange <= max_total",
            ));
        }

        check_pct("drawdown.max_drawdown_pct", self.drawdown.max_drawdown_pct)?;
        if self.drawdown.emergency_exit_enabled {
            check_pct("drawdown.emergency_exit_pct", self.drawdown.emergency_exit_pct)?;
            if self.drawdown.emergency_exit_pct <= self.drawdown.max_drawdown_pct {
                return Err(invalid(
                    "drawdown.emergency_exit_pct must be greater than drawdown.max_drawdown_pct",
                ));
            }
        }
        if self.drawdown.calculation_period_days == 0 {
            return Err(invalid("drawdown.calculation_period_days must be at least 1"));
        }

        check_pct("max_position_size_pct", self.max_position_size_pct)?;
        if self.max_concurrent_trades == 0 {
            return Err(invalid("max_concurrent_trades must be at least 1"));
        }
        if self.max_per_asset_trades == 0 {
            return Err(invalid("max_per_asset_trades must be at least 1"));
        }
        if self.risk_check_interval_secs == 0 {
            return Err(invalid("risk_check_interval_secs must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_policy_is_valid() {
        RiskPolicy::default().validate().unwrap();
    }

    #[test]
    fn test_exposure_ordering_enforced() {
        let mut policy = RiskPolicy::default();
        policy.exposure.max_per_asset = dec!(6000);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_emergency_must_exceed_max_drawdown() {
        let mut policy = RiskPolicy::default();
        policy.drawdown.emergency_exit_pct = dec!(15);
        assert!(policy.validate().is_err());

        policy.drawdown.emergency_exit_enabled = false;
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_trailing_activation_must_exceed_distance() {
        let mut policy = RiskPolicy::default();
        policy.trailing_stop.enabled = true;
        policy.trailing_stop.activation_pct = dec!(1);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_stop_below_take_profit() {
        let mut policy = RiskPolicy::default();
        policy.stop_loss.percentage = dec!(6);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_percentages_bounded() {
        let mut policy = RiskPolicy::default();
        policy.max_position_size_pct = dec!(120);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_cooldown_grows_and_caps() {
        let policy = RiskPolicy::default();
        assert_eq!(policy.cooldown(60, 0), Duration::from_secs(60));
        assert_eq!(policy.cooldown(60, 2), Duration::from_secs(240));
        assert_eq!(policy.cooldown(60, 20), Duration::from_secs(3_600));
    }
}
