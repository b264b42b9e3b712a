use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::ConfigError;
use crate::exchange::VenueLimits;
use crate::execution::ExecutionConfig;
use crate::orchestrator::{OrchestratorConfig, StrategyTuple};
use crate::risk::RiskPolicy;
use crate::strategy::StrategyRegistry;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "TRADEBOT";

/// Simulated venue used in dry-run mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueConfig {
    pub name: String,
    #[serde(default)]
    pub seed: u64,
    /// Taker fee as a fraction (0.001 = 0.1%)
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    #[serde(default)]
    pub markets: Vec<MarketConfig>,
    /// Overrides the venue's published request budget
    #[serde(default)]
    pub limits: Option<VenueLimits>,
}

/// Starting price of one simulated pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketConfig {
    pub pair: String,
    pub price: Decimal,
}

fn default_fee_rate() -> Decimal {
    Decimal::new(1, 3)
}

/// Everything the process needs, built once at startup and injected from there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Simulate orders instead of sending them to a live venue
    pub dry_run: bool,
    /// Portfolio value at start; drawdown and position sizing are measured against it
    pub initial_capital: Decimal,
    /// Postgres connection string; the in-memory store is used when absent
    pub database_url: Option<String>,
    pub venues: Vec<VenueConfig>,
    pub risk: RiskPolicy,
    pub execution: ExecutionConfig,
    pub orchestrator: OrchestratorConfig,
    pub strategies: Vec<StrategyTuple>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            initial_capital: Decimal::new(10_000, 0),
            database_url: None,
            venues: Vec::new(),
            risk: RiskPolicy::default(),
            execution: ExecutionConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            strategies: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Layer the TOML file (optional unless given explicitly) under `TRADEBOT__*`
    /// environment variables, e.g. `TRADEBOT__RISK__MAX_CONCURRENT_TRADES=3`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => ::config::File::from(path).required(true),
            None => ::config::File::with_name(DEFAULT_CONFIG_PATH).required(false),
        };

        let settings = ::config::Config::builder()
            .add_source(file)
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn enabled_strategies(&self) -> impl Iterator<Item = &StrategyTuple> {
        self.strategies.iter().filter(|s| s.enabled)
    }

    /// Reject anything that would make the process start in a half-valid state.
    pub fn validate(&self, strategies: &StrategyRegistry) -> Result<(), ConfigError> {
        if self.initial_capital <= Decimal::ZERO {
            return Err(ConfigError::Invalid(format!(
                "initial_capital must be positive, got {}",
                self.initial_capital
            )));
        }

        self.risk.validate()?;
        self.execution.validate()?;
        self.orchestrator.validate()?;

        let mut venues = HashSet::new();
        for venue in &self.venues {
            if !venues.insert(venue.name.as_str()) {
                return Err(ConfigError::Invalid(format!("venue '{}' configured twice", venue.name)));
            }
            if venue.fee_rate < Decimal::ZERO || venue.fee_rate >= Decimal::ONE {
                return Err(ConfigError::Invalid(format!(
                    "venue '{}': fee_rate must be within [0, 1)",
                    venue.name
                )));
            }
            if let Some(market) = venue.markets.iter().find(|m| m.price <= Decimal::ZERO) {
                return Err(ConfigError::Invalid(format!(
                    "venue '{}': starting price of {} must be positive",
                    venue.name, market.pair
                )));
            }
        }

        let mut ids = HashSet::new();
        for tuple in self.enabled_strategies() {
            if !ids.insert(tuple.id.as_str()) {
                return Err(ConfigError::Invalid(format!("strategy id '{}' used twice", tuple.id)));
            }
            if !venues.contains(tuple.venue.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "strategy '{}' trades on unknown venue '{}'",
                    tuple.id, tuple.venue
                )));
            }
            strategies.validate_parameters(&tuple.strategy, &tuple.parameters)?;
        }
        if ids.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one enabled strategy is required".to_string(),
            ));
        }

        Ok(())
    }
}
