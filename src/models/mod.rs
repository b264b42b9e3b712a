use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod order;
pub mod position;

pub use order::{Order, OrderIntent, OrderSide, OrderStatus, OrderType};
pub use position::{ExitReason, PendingExit, Position, PositionSide, PositionStatus, RiskState};

/// Free-form plugin parameters and signal metadata.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// OHLCV candlestick
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Candle interval supported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    W1,
}

impl Timeframe {
    pub fn as_secs(&self) -> u64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M3 => 180,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H2 => 7_200,
            Timeframe::H4 => 14_400,
            Timeframe::H6 => 21_600,
            Timeframe::H8 => 28_800,
            Timeframe::H12 => 43_200,
            Timeframe::D1 => 86_400,
            Timeframe::W1 => 604_800,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    /// First boundary strictly after `now`, aligned to multiples of the timeframe since the epoch.
    ///
    /// An hourly timeframe ticks at XX:00:00, a 5m timeframe at XX:00, XX:05, ...
    pub fn next_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.as_secs() as i64;
        let secs = now.timestamp();
        let next = (secs.div_euclid(period) + 1) * period;
        Utc.timestamp_opt(next, 0).single().unwrap_or(now)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tf = match s {
            "1m" => Timeframe::M1,
            "3m" => Timeframe::M3,
            "5m" => Timeframe::M5,
            "15m" => Timeframe::M15,
            "30m" => Timeframe::M30,
            "1h" => Timeframe::H1,
            "2h" => Timeframe::H2,
            "4h" => Timeframe::H4,
            "6h" => Timeframe::H6,
            "8h" => Timeframe::H8,
            "12h" => Timeframe::H12,
            "1d" => Timeframe::D1,
            "1w" => Timeframe::W1,
            other => return Err(format!("unsupported timeframe '{}'", other)),
        };
        Ok(tf)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

/// Logical trading key: at most one in-flight order and one open position per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradingKey {
    pub strategy_id: String,
    pub pair: String,
    pub venue: String,
}

impl TradingKey {
    pub fn new(
        strategy_id: impl Into<String>,
        pair: impl Into<String>,
        venue: impl Into<String>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            pair: pair.into(),
            venue: venue.into(),
        }
    }

    /// Base asset of the pair ("BTC" for "BTC/USDT").
    pub fn base_asset(&self) -> &str {
        base_asset(&self.pair)
    }
}

impl fmt::Display for TradingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.strategy_id, self.pair, self.venue)
    }
}

pub fn base_asset(pair: &str) -> &str {
    pair.split(['/', '-']).next().unwrap_or(pair)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalAction::Buy => f.write_str("buy"),
            SignalAction::Sell => f.write_str("sell"),
            SignalAction::Hold => f.write_str("hold"),
        }
    }
}

/// Trading signal produced by the strategy runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub id: Uuid,
    pub action: SignalAction,
    /// Confidence in [0, 1]
    pub strength: f64,
    pub strategy_id: String,
    pub pair: String,
    pub venue: String,
    pub generated_at: DateTime<Utc>,
    pub metadata: Parameters,
}

impl Signal {
    pub fn new(action: SignalAction, strength: f64, key: &TradingKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            strength: if strength.is_finite() {
                strength.clamp(0.0, 1.0)
            } else {
                0.0
            },
            strategy_id: key.strategy_id.clone(),
            pair: key.pair.clone(),
            venue: key.venue.clone(),
            generated_at: Utc::now(),
            metadata: Parameters::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Parameters) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn key(&self) -> TradingKey {
        TradingKey::new(&self.strategy_id, &self.pair, &self.venue)
    }

    pub fn is_hold(&self) -> bool {
        self.action == SignalAction::Hold
    }

    /// Explicit order size carried in the metadata, if the strategy supplied one.
    pub fn quantity_hint(&self) -> Option<Decimal> {
        match self.metadata.get("quantity")? {
            serde_json::Value::String(s) => s.parse::<Decimal>().ok(),
            serde_json::Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
            _ => None,
        }
        .filter(|q| q.is_sign_positive() && !q.is_zero())
    }
}
