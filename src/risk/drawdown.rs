use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;

/// Portfolio value against its peak over a rolling window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawdownSnapshot {
    pub equity: Decimal,
    pub peak_equity: Decimal,
    /// Decline from the window peak, in percent
    pub drawdown_pct: Decimal,
}

/// Rolling-window peak tracker.
///
/// Keeps a monotonically decreasing queue of equity samples, so the window peak is the
/// front and memory stays bounded by the number of new highs inside the window.
#[derive(Debug, Clone)]
pub struct DrawdownTracker {
    window: Duration,
    peaks: VecDeque<(DateTime<Utc>, Decimal)>,
    current: Decimal,
}

impl DrawdownTracker {
    pub fn new(initial_equity: Decimal, period_days: u32, at: DateTime<Utc>) -> Self {
        let mut peaks = VecDeque::new();
        peaks.push_back((at, initial_equity));
        Self {
            window: Duration::days(period_days.max(1) as i64),
            peaks,
            current: initial_equity,
        }
    }

    /// Rebuild a tracker from recorded equity samples, oldest first.
    ///
    /// Falls back to `initial_equity` at `now` when no sample is recent enough to matter.
    pub fn from_samples(
        initial_equity: Decimal,
        period_days: u32,
        samples: impl IntoIterator<Item = (DateTime<Utc>, Decimal)>,
        now: DateTime<Utc>,
    ) -> Self {
        let window = Duration::days(period_days.max(1) as i64);
        let cutoff = now - window;
        let mut recent = samples.into_iter().filter(|(at, _)| *at >= cutoff);

        let Some((first_at, first)) = recent.next() else {
            return Self::new(initial_equity, period_days, now);
        };
        let mut tracker = Self::new(first, period_days, first_at);
        for (at, equity) in recent {
            tracker.update(equity, at);
        }
        tracker
    }

    pub fn update(&mut self, equity: Decimal, at: DateTime<Utc>) -> DrawdownSnapshot {
        self.current = equity;

        while self.peaks.back().is_some_and(|(_, value)| *value <= equity) {
            self.peaks.pop_back();
        }
        self.peaks.push_back((at, equity));

        let cutoff = at - self.window;
        while self.peaks.len() > 1 && self.peaks.front().is_some_and(|(t, _)| *t < cutoff) {
            self.peaks.pop_front();
        }

        self.snapshot()
    }

    pub fn snapshot(&self) -> DrawdownSnapshot {
        let peak = self
            .peaks
            .front()
            .map(|(_, value)| *value)
            .unwrap_or(self.current)
            .max(self.current);
        let drawdown_pct = if peak > Decimal::ZERO {
            (peak - self.current) / peak * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        DrawdownSnapshot {
            equity: self.current,
            peak_equity: peak,
            drawdown_pct,
        }
    }
}
