use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use super::{Balance, ExchangeAdapter, ExchangeResult, OrderAck, OrderRequest, Ticker};
use crate::error::ExchangeError;
use crate::models::{Candle, Timeframe};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Request budget for one venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueLimits {
    pub requests_per_second: u32,
    pub burst: u32,
    /// Simultaneous in-flight requests
    pub max_in_flight: usize,
}

impl Default for VenueLimits {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst: 10,
            max_in_flight: 4,
        }
    }
}

/// Per-venue concurrency guard plus token bucket.
///
/// Both are lock-free: a semaphore permit bounds in-flight calls and the GCRA limiter
/// paces them. Nothing is locked while a venue call is awaited.
#[derive(Clone)]
pub struct VenueThrottle {
    venue: String,
    limiter: Arc<DirectRateLimiter>,
    slots: Arc<Semaphore>,
    max_in_flight: usize,
}

impl VenueThrottle {
    pub fn new(venue: impl Into<String>, limits: &VenueLimits) -> Self {
        let per_second = NonZeroU32::new(limits.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(limits.burst).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);
        let max_in_flight = limits.max_in_flight.max(1);

        Self {
            venue: venue.into(),
            limiter: Arc::new(RateLimiter::direct(quota)),
            slots: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    /// Wait for an in-flight slot, then for a rate token. The slot is released when the permit drops.
    pub async fn acquire(&self) -> ExchangeResult<OwnedSemaphorePermit> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExchangeError::Venue(format!("{} throttle closed", self.venue)))?;
        self.limiter.until_ready().await;
        Ok(permit)
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.slots.available_permits()
    }
}

/// An adapter behind its venue throttle, with a timeout on every call.
pub struct VenueClient {
    adapter: Arc<dyn ExchangeAdapter>,
    throttle: VenueThrottle,
}

impl VenueClient {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>, limits: &VenueLimits) -> Self {
        let throttle = VenueThrottle::new(adapter.name(), limits);
        Self { adapter, throttle }
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    pub fn throttle(&self) -> &VenueThrottle {
        &self.throttle
    }

    async fn guarded<T, F>(&self, limit: Duration, call: F) -> ExchangeResult<T>
    where
        F: Future<Output = ExchangeResult<T>>,
    {
        let bounded = async {
            let _permit = self.throttle.acquire().await?;
            call.await
        };
        match timeout(limit, bounded).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(limit)),
        }
    }

    pub async fn is_tradable(&self, pair: &str, limit: Duration) -> ExchangeResult<bool> {
        self.guarded(limit, self.adapter.is_tradable(pair)).await
    }

    pub async fn fetch_ticker(&self, pair: &str, limit: Duration) -> ExchangeResult<Ticker> {
        self.guarded(limit, self.adapter.fetch_ticker(pair)).await
    }

    pub async fn fetch_ohlcv(
        &self,
        pair: &str,
        timeframe: Timeframe,
        candles: usize,
        limit: Duration,
    ) -> ExchangeResult<Vec<Candle>> {
        self.guarded(limit, self.adapter.fetch_ohlcv(pair, timeframe, candles))
            .await
    }

    pub async fn fetch_balance(&self, limit: Duration) -> ExchangeResult<Vec<Balance>> {
        self.guarded(limit, self.adapter.fetch_balance()).await
    }

    pub async fn fetch_order_status(
        &self,
        venue_order_id: &str,
        pair: &str,
        limit: Duration,
    ) -> ExchangeResult<OrderAck> {
        self.guarded(limit, self.adapter.fetch_order_status(venue_order_id, pair))
            .await
    }

    pub async fn fetch_open_orders(
        &self,
        pair: Option<&str>,
        limit: Duration,
    ) -> ExchangeResult<Vec<OrderAck>> {
        self.guarded(limit, self.adapter.fetch_open_orders(pair)).await
    }

    // Order placement is reserved for the execution engine.
    pub(crate) async fn create_order(
        &self,
        request: &OrderRequest,
        limit: Duration,
    ) -> ExchangeResult<OrderAck> {
        self.guarded(limit, self.adapter.create_order(request)).await
    }

    pub(crate) async fn cancel_order(
        &self,
        venue_order_id: &str,
        pair: &str,
        limit: Duration,
    ) -> ExchangeResult<OrderAck> {
        self.guarded(limit, self.adapter.cancel_order(venue_order_id, pair))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_in_flight: usize) -> VenueLimits {
        VenueLimits {
            requests_per_second: 100,
            burst: 100,
            max_in_flight,
        }
    }

    #[tokio::test]
    async fn test_permits_track_in_flight() {
        let throttle = VenueThrottle::new("paper", &limits(2));
        assert_eq!(throttle.in_flight(), 0);

        let first = throttle.acquire().await.unwrap();
        let second = throttle.acquire().await.unwrap();
        assert_eq!(throttle.in_flight(), 2);

        drop(first);
        assert_eq!(throttle.in_flight(), 1);
        drop(second);
        assert_eq!(throttle.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_bounds_concurrency() {
        let throttle = VenueThrottle::new("paper", &limits(1));
        let _held = throttle.acquire().await.unwrap();

        let blocked = timeout(Duration::from_millis(100), throttle.acquire()).await;
        assert!(blocked.is_err(), "second caller must wait for the slot");
    }

    #[test]
    fn test_zero_limits_fall_back_to_minimums() {
        let throttle = VenueThrottle::new(
            "paper",
            &VenueLimits {
                requests_per_second: 0,
                burst: 0,
                max_in_flight: 0,
            },
        );
        assert_eq!(throttle.max_in_flight, 1);
    }
}
