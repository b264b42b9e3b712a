use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::{Balance, ExchangeAdapter, ExchangeResult, OrderAck, OrderRequest, Ticker, VenueLimits};
use crate::error::ExchangeError;
use crate::models::{Candle, OrderSide, OrderStatus, OrderType, Timeframe};

/// In-process simulated venue used for dry-run.
///
/// Market data is a seeded random walk around the last price; market orders fill
/// immediately at the last price, limit orders rest until the price crosses them.
/// Faults and latency can be scripted to rehearse failure handling.
pub struct PaperExchange {
    name: String,
    fee_rate: Decimal,
    quote_balance: Decimal,
    latency_ms: AtomicU32,
    create_calls: AtomicU32,
    state: Mutex<PaperState>,
}

struct PaperState {
    rng: StdRng,
    volatility: f64,
    markets: HashMap<String, Market>,
    orders: HashMap<String, OrderAck>,
    order_limits: HashMap<String, (OrderSide, Decimal, Decimal)>,
    by_client_id: HashMap<Uuid, String>,
    order_faults: VecDeque<ExchangeError>,
    market_data_faults: VecDeque<ExchangeError>,
    short_fill: Option<Decimal>,
    next_order_id: u64,
}

struct Market {
    price: Decimal,
    scripted_candles: Option<Vec<Candle>>,
}

impl PaperExchange {
    pub fn new(name: impl Into<String>, seed: u64) -> Self {
        Self {
            name: name.into(),
            fee_rate: Decimal::new(1, 3), // 0.1%
            quote_balance: Decimal::new(100_000, 0),
            latency_ms: AtomicU32::new(0),
            create_calls: AtomicU32::new(0),
            state: Mutex::new(PaperState {
                rng: StdRng::seed_from_u64(seed),
                volatility: 0.002,
                markets: HashMap::new(),
                orders: HashMap::new(),
                order_limits: HashMap::new(),
                by_client_id: HashMap::new(),
                order_faults: VecDeque::new(),
                market_data_faults: VecDeque::new(),
                short_fill: None,
                next_order_id: 1,
            }),
        }
    }

    pub fn with_market(self, pair: &str, price: Decimal) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.markets.insert(
                pair.to_string(),
                Market {
                    price,
                    scripted_candles: None,
                },
            );
        }
        self
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn with_quote_balance(mut self, balance: Decimal) -> Self {
        self.quote_balance = balance;
        self
    }

    /// Per-step relative price noise; 0 freezes prices
    pub fn with_volatility(self, volatility: f64) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.volatility = volatility.abs();
        }
        self
    }

    pub fn set_price(&self, pair: &str, price: Decimal) {
        if let Ok(mut state) = self.state.lock() {
            state
                .markets
                .entry(pair.to_string())
                .or_insert(Market {
                    price,
                    scripted_candles: None,
                })
                .price = price;
        }
    }

    /// Serve these candles from `fetch_ohlcv` instead of the random walk.
    pub fn set_candles(&self, pair: &str, candles: Vec<Candle>) {
        if let Ok(mut state) = self.state.lock() {
            let price = candles.last().map(|c| c.close).unwrap_or_default();
            let market = state.markets.entry(pair.to_string()).or_insert(Market {
                price,
                scripted_candles: None,
            });
            market.price = price;
            market.scripted_candles = Some(candles);
        }
    }

    /// The next `create_order` calls fail with these errors, in order.
    pub fn inject_order_faults(&self, faults: Vec<ExchangeError>) {
        if let Ok(mut state) = self.state.lock() {
            state.order_faults.extend(faults);
        }
    }

    /// The next market-data calls fail with these errors, in order.
    pub fn inject_market_data_faults(&self, faults: Vec<ExchangeError>) {
        if let Ok(mut state) = self.state.lock() {
            state.market_data_faults.extend(faults);
        }
    }

    /// Market orders report `Filled` but execute only this fraction of the request,
    /// like a venue trimming to its lot size. `None` restores full fills.
    pub fn set_short_fill(&self, fraction: Option<Decimal>) {
        if let Ok(mut state) = self.state.lock() {
            state.short_fill = fraction;
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis().min(u32::MAX as u128) as u32, Ordering::SeqCst);
    }

    /// Number of `create_order` calls received, including failed ones
    pub fn create_order_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Orders the venue knows about (accepted, whatever their status)
    pub fn order_count(&self) -> usize {
        self.state.lock().map(|s| s.orders.len()).unwrap_or(0)
    }

    fn state(&self) -> ExchangeResult<MutexGuard<'_, PaperState>> {
        self.state
            .lock()
            .map_err(|_| ExchangeError::Venue("paper venue state poisoned".to_string()))
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        }
    }

    fn fee_for(&self, price: Decimal, quantity: Decimal) -> Decimal {
        (price * quantity * self.fee_rate).round_dp(8)
    }
}

impl PaperState {
    fn market_fault(&mut self) -> ExchangeResult<()> {
        match self.market_data_faults.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn market(&mut self, pair: &str) -> ExchangeResult<&mut Market> {
        self.markets
            .get_mut(pair)
            .ok_or_else(|| ExchangeError::NotTradable(pair.to_string()))
    }

    fn noise(&mut self) -> f64 {
        if self.volatility == 0.0 {
            return 0.0;
        }
        let v = self.volatility;
        self.rng.gen_range(-v..v)
    }

    /// Advance the random walk one step and return the new last price.
    fn step(&mut self, pair: &str) -> ExchangeResult<Decimal> {
        let noise = self.noise();
        let market = self.market(pair)?;
        if market.scripted_candles.is_none() && noise != 0.0 {
            let factor = Decimal::from_f64(1.0 + noise).unwrap_or(Decimal::ONE);
            market.price = (market.price * factor).round_dp(6);
        }
        Ok(market.price)
    }

    // Walk backwards from the last price so the newest close equals the current price.
    fn history(&mut self, pair: &str, timeframe: Timeframe, limit: usize) -> ExchangeResult<Vec<Candle>> {
        let market = self.market(pair)?;
        if let Some(scripted) = &market.scripted_candles {
            let skip = scripted.len().saturating_sub(limit);
            return Ok(scripted[skip..].to_vec());
        }

        let last = market.price.to_f64().unwrap_or(0.0);
        let period = ChronoDuration::seconds(timeframe.as_secs() as i64);
        let newest_open = timeframe.next_boundary(Utc::now()) - period;

        let mut closes = Vec::with_capacity(limit);
        let mut price = last;
        for _ in 0..limit {
            closes.push(price);
            price *= 1.0 + self.noise();
        }
        closes.reverse();

        let mut candles = Vec::with_capacity(limit);
        for (i, close) in closes.into_iter().enumerate() {
            let age = (limit - 1 - i) as i32;
            let timestamp = newest_open - period * age;
            candles.push(self.candle(close, timestamp));
        }
        Ok(candles)
    }

    fn candle(&mut self, close: f64, timestamp: chrono::DateTime<Utc>) -> Candle {
        let wiggle = self.volatility.max(0.0);
        let (high, low, open) = if wiggle == 0.0 {
            (close, close, close)
        } else {
            let high = close * (1.0 + self.rng.gen_range(0.0..wiggle));
            let low = close * (1.0 - self.rng.gen_range(0.0..wiggle));
            let open = (close * (1.0 + self.rng.gen_range(-wiggle..wiggle))).clamp(low, high);
            (high, low, open)
        };
        let volume = 1_000.0 * self.rng.gen_range(0.7..1.3);

        let dec = |v: f64| Decimal::from_f64(v).unwrap_or_default().round_dp(6);
        Candle {
            timestamp,
            open: dec(open),
            high: dec(high),
            low: dec(low),
            close: dec(close),
            volume: dec(volume),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> VenueLimits {
        VenueLimits {
            requests_per_second: 50,
            burst: 50,
            max_in_flight: 8,
        }
    }

    async fn is_tradable(&self, pair: &str) -> ExchangeResult<bool> {
        Ok(self.state()?.markets.contains_key(pair))
    }

    async fn fetch_ticker(&self, pair: &str) -> ExchangeResult<Ticker> {
        self.simulate_latency().await;
        let mut state = self.state()?;
        state.market_fault()?;
        let last = state.step(pair)?;
        Ok(Ticker {
            pair: pair.to_string(),
            last,
            bid: Some(last),
            ask: Some(last),
            timestamp: Utc::now(),
        })
    }

    async fn fetch_ohlcv(
        &self,
        pair: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        self.simulate_latency().await;
        let mut state = self.state()?;
        state.market_fault()?;
        state.step(pair)?;
        state.history(pair, timeframe, limit)
    }

    async fn fetch_balance(&self) -> ExchangeResult<Vec<Balance>> {
        Ok(vec![Balance {
            currency: "USDT".to_string(),
            free: self.quote_balance,
            total: self.quote_balance,
        }])
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.state()?;
        if let Some(fault) = state.order_faults.pop_front() {
            return Err(fault);
        }

        // Resubmission of an order we already accepted
        if let Some(existing) = state.by_client_id.get(&request.client_order_id) {
            if let Some(ack) = state.orders.get(existing) {
                return Ok(ack.clone());
            }
        }

        if request.quantity <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder(format!(
                "quantity must be positive, got {}",
                request.quantity
            )));
        }
        let price = state.market(&request.pair)?.price;
        if request.order_type == OrderType::Limit && request.price.is_none() {
            return Err(ExchangeError::InvalidOrder("limit order without price".to_string()));
        }

        let venue_order_id = format!("paper-{}", state.next_order_id);
        state.next_order_id += 1;

        let fill_price = match (request.order_type, request.price) {
            (OrderType::Market, _) => Some(price),
            (OrderType::Limit, Some(limit)) if crosses(request.side, limit, price) => Some(limit),
            _ => None,
        };

        let executed = match (request.order_type, state.short_fill) {
            (OrderType::Market, Some(fraction)) => (request.quantity * fraction).round_dp(8),
            _ => request.quantity,
        };
        let ack = match fill_price {
            Some(fill) => OrderAck {
                venue_order_id: venue_order_id.clone(),
                client_order_id: Some(request.client_order_id),
                pair: request.pair.clone(),
                status: OrderStatus::Filled,
                filled_quantity: executed,
                average_price: Some(fill),
                fee: self.fee_for(fill, executed),
                fee_currency: Some("USDT".to_string()),
            },
            None => {
                if let Some(limit) = request.price {
                    state
                        .order_limits
                        .insert(venue_order_id.clone(), (request.side, limit, request.quantity));
                }
                OrderAck {
                    venue_order_id: venue_order_id.clone(),
                    client_order_id: Some(request.client_order_id),
                    pair: request.pair.clone(),
                    status: OrderStatus::Open,
                    filled_quantity: Decimal::ZERO,
                    average_price: None,
                    fee: Decimal::ZERO,
                    fee_currency: None,
                }
            }
        };

        state.by_client_id.insert(request.client_order_id, venue_order_id.clone());
        state.orders.insert(venue_order_id, ack.clone());
        if ack.status == OrderStatus::Open {
            tracing::debug!("📝 Paper limit order resting: {} {}", request.pair, request.quantity);
        }
        Ok(ack)
    }

    async fn cancel_order(&self, venue_order_id: &str, _pair: &str) -> ExchangeResult<OrderAck> {
        self.simulate_latency().await;
        let mut state = self.state()?;
        state.order_limits.remove(venue_order_id);
        let ack = state
            .orders
            .get_mut(venue_order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(venue_order_id.to_string()))?;
        if !ack.status.is_terminal() {
            ack.status = OrderStatus::Cancelled;
        }
        Ok(ack.clone())
    }

    async fn fetch_order_status(&self, venue_order_id: &str, _pair: &str) -> ExchangeResult<OrderAck> {
        self.simulate_latency().await;
        let mut state = self.state()?;
        let resting = state.order_limits.get(venue_order_id).copied();
        let pair = state
            .orders
            .get(venue_order_id)
            .map(|a| a.pair.clone())
            .ok_or_else(|| ExchangeError::OrderNotFound(venue_order_id.to_string()))?;

        if let Some((side, limit, quantity)) = resting {
            let price = state.market(&pair)?.price;
            if crosses(side, limit, price) {
                state.order_limits.remove(venue_order_id);
                let fee = self.fee_for(limit, quantity);
                if let Some(ack) = state.orders.get_mut(venue_order_id) {
                    ack.status = OrderStatus::Filled;
                    ack.filled_quantity = quantity;
                    ack.average_price = Some(limit);
                    ack.fee = fee;
                    ack.fee_currency = Some("USDT".to_string());
                }
            }
        }

        state
            .orders
            .get(venue_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(venue_order_id.to_string()))
    }

    async fn fetch_open_orders(&self, pair: Option<&str>) -> ExchangeResult<Vec<OrderAck>> {
        let state = self.state()?;
        Ok(state
            .orders
            .values()
            .filter(|a| !a.status.is_terminal())
            .filter(|a| pair.map_or(true, |p| a.pair == p))
            .cloned()
            .collect())
    }
}

fn crosses(side: OrderSide, limit: Decimal, price: Decimal) -> bool {
    match side {
        OrderSide::Buy => price <= limit,
        OrderSide::Sell => price >= limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn venue() -> PaperExchange {
        PaperExchange::new("paper", 42)
            .with_market("BTC/USDT", dec!(100))
            .with_volatility(0.0)
    }

    fn market_buy(quantity: Decimal) -> OrderRequest {
        OrderRequest {
            client_order_id: Uuid::new_v4(),
            pair: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity,
            price: None,
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_at_last_price() {
        let venue = venue();
        let ack = venue.create_order(&market_buy(dec!(2))).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.filled_quantity, dec!(2));
        assert_eq!(ack.average_price, Some(dec!(100)));
        assert_eq!(ack.fee, dec!(0.2));
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let venue = venue();
        let request = market_buy(dec!(1));
        let first = venue.create_order(&request).await.unwrap();
        let second = venue.create_order(&request).await.unwrap();
        assert_eq!(first.venue_order_id, second.venue_order_id);
        assert_eq!(venue.order_count(), 1);
        assert_eq!(venue.create_order_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_faults_come_first() {
        let venue = venue();
        venue.inject_order_faults(vec![ExchangeError::Network("reset".into())]);
        assert!(venue.create_order(&market_buy(dec!(1))).await.is_err());
        assert!(venue.create_order(&market_buy(dec!(1))).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_pair_is_not_tradable() {
        let venue = venue();
        let mut request = market_buy(dec!(1));
        request.pair = "DOGE/USDT".into();
        let err = venue.create_order(&request).await.unwrap_err();
        assert!(matches!(err, ExchangeError::NotTradable(_)));
        assert!(!venue.is_tradable("DOGE/USDT").await.unwrap());
    }

    #[tokio::test]
    async fn test_limit_order_rests_then_cancels() {
        let venue = venue();
        let request = OrderRequest {
            order_type: OrderType::Limit,
            price: Some(dec!(90)),
            ..market_buy(dec!(1))
        };
        let ack = venue.create_order(&request).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(venue.fetch_open_orders(None).await.unwrap().len(), 1);

        let cancelled = venue.cancel_order(&ack.venue_order_id, "BTC/USDT").await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(venue.fetch_open_orders(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_ends_at_current_price() {
        let venue = PaperExchange::new("paper", 7).with_market("ETH/USDT", dec!(2500));
        let candles = venue.fetch_ohlcv("ETH/USDT", Timeframe::H1, 50).await.unwrap();
        assert_eq!(candles.len(), 50);
        for pair in candles.windows(2) {
            assert_eq!(
                (pair[1].timestamp - pair[0].timestamp).num_seconds(),
                3_600
            );
        }
        let ticker_price = venue.state().unwrap().markets["ETH/USDT"].price;
        assert_eq!(candles.last().unwrap().close, ticker_price.round_dp(6));
    }
}
