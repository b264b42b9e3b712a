use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{Indicator, IndicatorSeries};
use crate::error::PluginError;
use crate::models::{Candle, Parameters, Timeframe};

pub const DEFAULT_CACHE_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// LRU of computed indicator series.
///
/// Keyed by pair, timeframe, indicator name and a SHA-256 over the canonical parameters and
/// the newest candle timestamp, so a new candle invalidates naturally.
pub struct IndicatorCache {
    entries: Mutex<LruCache<String, Arc<IndicatorSeries>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl IndicatorCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn cache_key(
        pair: &str,
        timeframe: Timeframe,
        indicator: &str,
        params: &Parameters,
        candles: &[Candle],
    ) -> String {
        let mut hasher = Sha256::new();
        // serde_json maps are ordered by key, which makes this canonical
        hasher.update(serde_json::Value::Object(params.clone()).to_string().as_bytes());
        // The newest candle may still be forming, so its close is part of the key
        if let Some(last) = candles.last() {
            hasher.update(last.timestamp.timestamp_millis().to_be_bytes());
            hasher.update(last.close.to_string().as_bytes());
        }
        hasher.update((candles.len() as u64).to_be_bytes());
        format!(
            "{}|{}|{}|{}",
            pair,
            timeframe,
            indicator,
            hex::encode(hasher.finalize())
        )
    }

    /// Cached series, or compute it. The computation runs without the cache lock held.
    pub fn get_or_compute(
        &self,
        pair: &str,
        timeframe: Timeframe,
        indicator: &dyn Indicator,
        candles: &[Candle],
        params: &Parameters,
    ) -> Result<Arc<IndicatorSeries>, PluginError> {
        let key = Self::cache_key(pair, timeframe, indicator.name(), params, candles);

        if let Some(series) = self.lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(series);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let series = Arc::new(indicator.calculate(candles, params)?);
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(key, series.clone());
        }
        Ok(series)
    }

    fn lookup(&self, key: &str) -> Option<Arc<IndicatorSeries>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().map(|e| e.len()).unwrap_or(0),
        }
    }
}

impl Default for IndicatorCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
