use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::models::TradingKey;

/// Keys with an unresolved order. Reservation is synchronous; a second caller is refused,
/// never queued.
#[derive(Debug, Clone, Default)]
pub struct InFlightTable {
    keys: Arc<Mutex<HashSet<TradingKey>>>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `key`, or `None` if an order is already in flight for it.
    pub fn try_reserve(&self, key: &TradingKey) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            keys: self.keys.clone(),
            key: key.clone(),
        })
    }

    pub fn contains(&self, key: &TradingKey) -> bool {
        self.keys
            .lock()
            .map(|keys| keys.contains(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().map(|keys| keys.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the key when dropped, whichever way the submission ends.
#[derive(Debug)]
pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<TradingKey>>>,
    key: TradingKey,
}

impl InFlightGuard {
    pub fn key(&self) -> &TradingKey {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut keys = self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        keys.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_reservation_refused() {
        let table = InFlightTable::new();
        let key = TradingKey::new("s1", "BTC/USDT", "paper");

        let guard = table.try_reserve(&key).unwrap();
        assert!(table.try_reserve(&key).is_none());
        assert!(table.contains(&key));

        let other = TradingKey::new("s2", "BTC/USDT", "paper");
        assert!(table.try_reserve(&other).is_some());

        drop(guard);
        assert!(!table.contains(&key));
        assert!(table.try_reserve(&key).is_some());
    }
}
