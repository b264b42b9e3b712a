use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::Timeframe;

/// Tokio instant of the next timeframe boundary after `now`, and the wait until it.
///
/// Boundaries are multiples of the timeframe since the Unix epoch, so every process
/// ticks on the same wall-clock grid.
pub fn next_tick(timeframe: Timeframe, now: DateTime<Utc>) -> (Instant, Duration) {
    let boundary = timeframe.next_boundary(now);
    let delay = (boundary - now).to_std().unwrap_or(Duration::ZERO);
    (Instant::now() + delay, delay)
}

/// The boundary after `fired`, re-anchored to the wall clock on every call.
///
/// A wake-up that lands slightly early still moves on to the following boundary, and a
/// loop that fell behind skips to the next boundary after `now`.
pub fn following_tick(
    timeframe: Timeframe,
    fired: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, Instant, Duration) {
    let boundary = timeframe.next_boundary(now.max(fired));
    let delay = (boundary - now).to_std().unwrap_or(Duration::ZERO);
    (boundary, Instant::now() + delay, delay)
}

/// Non-overlap guard for one tuple. A tick that finds the slot taken is skipped.
#[derive(Debug, Clone, Default)]
pub struct TickSlot {
    busy: Arc<AtomicBool>,
}

impl TickSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> Option<SlotGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard {
                busy: self.busy.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct SlotGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Consecutive-failure counter with an exponential, capped cooldown.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: u32,
    base: Duration,
    max: Duration,
    consecutive: u32,
    /// Cooldowns entered since the last successful tick
    rounds: u32,
    cooldown_until: Option<Instant>,
}

impl FailureTracker {
    pub fn new(threshold: u32, base: Duration, max: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            base,
            max,
            consecutive: 0,
            rounds: 0,
            cooldown_until: None,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
        self.rounds = 0;
        self.cooldown_until = None;
    }

    /// Count a failure. Returns the cooldown when this failure reaches the threshold.
    pub fn record_failure(&mut self, now: Instant) -> Option<Duration> {
        self.consecutive += 1;
        if self.consecutive < self.threshold {
            return None;
        }

        let factor = 2u32.saturating_pow(self.rounds.min(16));
        let cooldown = self.base.saturating_mul(factor).min(self.max);
        self.rounds = self.rounds.saturating_add(1);
        self.consecutive = 0;
        self.cooldown_until = Some(now + cooldown);
        Some(cooldown)
    }

    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}
