// Uniform venue contract, per-venue throttling, and the dry-run venue
pub mod paper;
pub mod throttle;

pub use paper::PaperExchange;
pub use throttle::{VenueClient, VenueLimits, VenueThrottle};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::models::{Candle, OrderSide, OrderStatus, OrderType, Timeframe};

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub pair: String,
    pub last: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub free: Decimal,
    pub total: Decimal,
}

/// Venue order request. `client_order_id` makes resubmission after a lost response idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: Uuid,
    pub pair: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

/// Venue view of an order after create/cancel/status calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub venue_order_id: String,
    pub client_order_id: Option<Uuid>,
    pub pair: String,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
    pub fee: Decimal,
    pub fee_currency: Option<String>,
}

/// Contract every venue integration implements.
///
/// Implementations must classify failures with [`ExchangeError`] so the execution engine
/// can tell transient faults from venue rejections.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Published request budget of the venue
    fn limits(&self) -> VenueLimits {
        VenueLimits::default()
    }

    async fn is_tradable(&self, pair: &str) -> ExchangeResult<bool>;

    async fn fetch_ticker(&self, pair: &str) -> ExchangeResult<Ticker>;

    async fn fetch_ohlcv(
        &self,
        pair: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;

    async fn fetch_balance(&self) -> ExchangeResult<Vec<Balance>>;

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck>;

    async fn cancel_order(&self, venue_order_id: &str, pair: &str) -> ExchangeResult<OrderAck>;

    async fn fetch_order_status(&self, venue_order_id: &str, pair: &str) -> ExchangeResult<OrderAck>;

    async fn fetch_open_orders(&self, pair: Option<&str>) -> ExchangeResult<Vec<OrderAck>>;
}

/// Adapters registered by name at startup.
#[derive(Clone, Default)]
pub struct ExchangeRegistry {
    venues: HashMap<String, Arc<VenueClient>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter; `limits` overrides the adapter's published budget.
    pub fn register(&mut self, adapter: Arc<dyn ExchangeAdapter>, limits: Option<VenueLimits>) {
        let name = adapter.name().to_string();
        let limits = limits.unwrap_or_else(|| adapter.limits());
        tracing::info!(
            "Registered venue '{}' ({} req/s, burst {}, {} in flight)",
            name,
            limits.requests_per_second,
            limits.burst,
            limits.max_in_flight
        );
        self.venues
            .insert(name, Arc::new(VenueClient::new(adapter, &limits)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<VenueClient>> {
        self.venues.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.venues.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.venues.keys().cloned().collect();
        names.sort();
        names
    }
}
