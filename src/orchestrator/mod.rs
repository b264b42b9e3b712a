// Per-tuple scheduling loops wiring strategy signals through risk checks into execution
pub mod schedule;

pub use schedule::{following_tick, next_tick, FailureTracker, SlotGuard, TickSlot};

use anyhow::{anyhow, Context};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::error::{ConfigError, ExecutionError};
use crate::events::EventPayload;
use crate::execution::{EntryOrder, ExecutionEngine, ExitOrder, OrderDirective};
use crate::indicators::cache::DEFAULT_CACHE_CAPACITY;
use crate::indicators::{IndicatorCache, IndicatorRegistry};
use crate::models::{
    ExitReason, OrderSide, OrderStatus, Position, RiskState, Signal, SignalAction, TradingKey,
};
use crate::risk::{PreTradeDecision, PriceBook, RiskEvaluator, RiskMonitor, RiskRule, TradeCandidate};
use crate::shutdown::Shutdown;
use crate::strategy::{StrategyRegistry, StrategyRunner};

/// A configured (strategy, pair, timeframe, venue) tuple.
pub use crate::persistence::StrategyRecord as StrategyTuple;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// OHLCV window fetched per tick (raised to the strategy minimum when smaller)
    pub candle_limit: usize,
    pub fetch_timeout_secs: u64,
    /// Consecutive failed ticks before a tuple cools down
    pub failure_threshold: u32,
    pub cooldown_base_secs: u64,
    pub cooldown_max_secs: u64,
    /// How long running ticks may take to finish after shutdown is requested
    pub shutdown_grace_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            candle_limit: 100,
            fetch_timeout_secs: 10,
            failure_threshold: 3,
            cooldown_base_secs: 60,
            cooldown_max_secs: 3_600,
            shutdown_grace_secs: 10,
        }
    }
}

impl OrchestratorConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candle_limit == 0 || self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.candle_limit and fetch_timeout_secs must be positive".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.cooldown_base_secs == 0 || self.cooldown_max_secs < self.cooldown_base_secs {
            return Err(ConfigError::Invalid(
                "orchestrator cooldowns must satisfy 0 < base <= max".to_string(),
            ));
        }
        Ok(())
    }
}

/// Strategy and indicator plugins shared by every tuple.
#[derive(Clone)]
pub struct Plugins {
    pub strategies: Arc<StrategyRegistry>,
    pub indicators: Arc<IndicatorRegistry>,
    pub cache: Arc<IndicatorCache>,
}

impl Plugins {
    pub fn builtin() -> Self {
        Self {
            strategies: Arc::new(StrategyRegistry::with_builtin()),
            indicators: Arc::new(IndicatorRegistry::with_builtin()),
            cache: Arc::new(IndicatorCache::new(DEFAULT_CACHE_CAPACITY)),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The previous tick for this tuple was still running
    Skipped,
    CoolingDown(Duration),
    Hold,
    /// A signal that needs no order (already positioned, exit pending, shorting disabled)
    Ignored(String),
    Rejected(RiskRule),
    Submitted { order_id: Uuid, status: OrderStatus },
    /// The engine refused the order before it reached the venue
    Refused(String),
    OrderFailed(String),
    /// Market data or strategy evaluation failed
    Failed(String),
}

struct TupleWorker {
    tuple: StrategyTuple,
    key: TradingKey,
    min_candles: usize,
    runner: Mutex<StrategyRunner>,
    slot: TickSlot,
    failures: Mutex<FailureTracker>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Drives one scheduling loop per tuple plus the risk monitor.
pub struct Orchestrator {
    workers: BTreeMap<String, Arc<TupleWorker>>,
    evaluator: Arc<RiskEvaluator>,
    engine: Arc<ExecutionEngine>,
    monitor: Arc<RiskMonitor>,
    config: OrchestratorConfig,
    shutdown: Shutdown,
}

impl Orchestrator {
    /// Build a runner for every enabled tuple. Fails on unknown plugins, bad parameters
    /// or duplicate tuple ids.
    pub fn new(
        config: OrchestratorConfig,
        tuples: &[StrategyTuple],
        plugins: &Plugins,
        evaluator: Arc<RiskEvaluator>,
        engine: Arc<ExecutionEngine>,
        monitor: Arc<RiskMonitor>,
        shutdown: Shutdown,
    ) -> Result<Self, ConfigError> {
        let mut workers = BTreeMap::new();
        for tuple in tuples.iter().filter(|t| t.enabled) {
            let key = TradingKey::new(&tuple.id, &tuple.pair, &tuple.venue);
            let strategy = plugins.strategies.create(&tuple.strategy, &tuple.parameters)?;
            let runner = StrategyRunner::new(
                key.clone(),
                tuple.timeframe,
                strategy,
                plugins.indicators.clone(),
                plugins.cache.clone(),
            )?;
            let worker = TupleWorker {
                tuple: tuple.clone(),
                key,
                min_candles: runner.min_candles(),
                runner: Mutex::new(runner),
                slot: TickSlot::new(),
                failures: Mutex::new(FailureTracker::new(
                    config.failure_threshold,
                    Duration::from_secs(config.cooldown_base_secs),
                    Duration::from_secs(config.cooldown_max_secs),
                )),
            };
            if workers.insert(tuple.id.clone(), Arc::new(worker)).is_some() {
                return Err(ConfigError::Invalid(format!("duplicate strategy id '{}'", tuple.id)));
            }
        }

        Ok(Self {
            workers,
            evaluator,
            engine,
            monitor,
            config,
            shutdown,
        })
    }

    pub fn tuple_ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn evaluator(&self) -> &Arc<RiskEvaluator> {
        &self.evaluator
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &Arc<RiskMonitor> {
        &self.monitor
    }

    /// Run every loop until shutdown, then drain the execution engine.
    ///
    /// Returns the number of orders left unreconciled.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<usize> {
        tracing::info!("🚀 Orchestrator starting {} strategy loop(s)", self.workers.len());

        let mut loops = JoinSet::new();
        loops.spawn(self.monitor.clone().run(self.shutdown.clone()));
        for worker in self.workers.values() {
            loops.spawn(self.clone().schedule(worker.clone()));
        }

        let reason = self.shutdown.wait().await;
        let grace = self.config.shutdown_grace();
        tracing::info!("🛑 Shutdown requested ({:?}), waiting up to {:?} for running ticks", reason, grace);

        let finished = tokio::time::timeout(grace, async {
            while let Some(result) = loops.join_next().await {
                if let Err(e) = result {
                    tracing::error!("❌ Scheduling loop ended abnormally: {}", e);
                }
            }
        })
        .await;
        if finished.is_err() {
            tracing::warn!("⚠️  {} loop(s) still busy after {:?}, cancelling them", loops.len(), grace);
            loops.abort_all();
        }

        let unreconciled = self
            .engine
            .drain(self.engine.config().drain_timeout())
            .await
            .context("draining execution engine")?;
        tracing::info!("👋 Orchestrator stopped ({} unreconciled order(s))", unreconciled);
        Ok(unreconciled)
    }

    // Ticks run in their own tasks so a slow tick never delays the schedule; the next
    // tick then finds the slot busy and is skipped. Each wake-up is re-anchored to the
    // wall-clock boundary, so the loop does not drift off the candle grid.
    async fn schedule(self: Arc<Self>, worker: Arc<TupleWorker>) {
        let timeframe = worker.tuple.timeframe;
        let now = Utc::now();
        let mut boundary = timeframe.next_boundary(now);
        let (start, delay) = next_tick(timeframe, now);
        tracing::info!(
            "⏱️  {} [{} {}] first tick in {:?}",
            worker.key,
            worker.tuple.strategy,
            timeframe,
            delay
        );

        let wake = sleep_until(start);
        tokio::pin!(wake);
        let mut ticks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = &mut wake => {
                    let orchestrator = self.clone();
                    let tick_worker = worker.clone();
                    ticks.spawn(async move { orchestrator.tick(&tick_worker).await });

                    let (next, at, _) = following_tick(timeframe, boundary, Utc::now());
                    boundary = next;
                    wake.as_mut().reset(at);
                }
                Some(result) = ticks.join_next(), if !ticks.is_empty() => {
                    if let Err(e) = result {
                        tracing::error!("❌ Tick task for {} panicked: {}", worker.key, e);
                    }
                }
            }
        }

        while ticks.join_next().await.is_some() {}
        tracing::debug!("Scheduling loop for {} stopped", worker.key);
    }

    /// Evaluate one tuple immediately, outside its schedule. Overlap rules still apply.
    pub async fn force(&self, tuple_id: &str) -> anyhow::Result<TickOutcome> {
        let worker = self
            .workers
            .get(tuple_id)
            .ok_or_else(|| anyhow!("unknown strategy id '{}'", tuple_id))?;
        tracing::info!("🔄 Forced evaluation of {}", worker.key);
        Ok(self.tick(worker).await)
    }

    async fn tick(&self, worker: &TupleWorker) -> TickOutcome {
        let Some(_slot) = worker.slot.try_enter() else {
            tracing::warn!("⏭️  Tick for {} skipped: previous tick still running", worker.key);
            return TickOutcome::Skipped;
        };

        if let Some(remaining) = lock(&worker.failures).cooldown_remaining(Instant::now()) {
            tracing::debug!("{} cooling down for another {:?}", worker.key, remaining);
            return TickOutcome::CoolingDown(remaining);
        }

        match self.evaluate(worker).await {
            Ok(outcome) => {
                lock(&worker.failures).record_success();
                outcome
            }
            Err(e) => {
                tracing::warn!("⚠️  Tick for {} failed: {:#}", worker.key, e);
                let cooldown = lock(&worker.failures).record_failure(Instant::now());
                if let Some(cooldown) = cooldown {
                    tracing::error!(
                        "🧊 {} failed {} ticks in a row, cooling down for {:?}",
                        worker.key,
                        self.config.failure_threshold,
                        cooldown
                    );
                    lock(&worker.runner).reset();
                }
                TickOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    async fn evaluate(&self, worker: &TupleWorker) -> anyhow::Result<TickOutcome> {
        let tuple = &worker.tuple;
        let client = self
            .engine
            .exchanges()
            .get(&tuple.venue)
            .ok_or_else(|| anyhow!("unknown venue '{}'", tuple.venue))?;

        let limit = self.config.candle_limit.max(worker.min_candles);
        let candles = client
            .fetch_ohlcv(&tuple.pair, tuple.timeframe, limit, self.config.fetch_timeout())
            .await
            .with_context(|| format!("fetching {} {} candles", tuple.pair, tuple.timeframe))?;
        let price = candles
            .last()
            .map(|c| c.close)
            .ok_or_else(|| anyhow!("venue returned no candles for {}", tuple.pair))?;

        let signal = lock(&worker.runner).evaluate(&candles)?;
        if signal.is_hold() {
            tracing::debug!("{}: hold", worker.key);
            return Ok(TickOutcome::Hold);
        }

        tracing::info!(
            "📊 {} signal for {} at {} (strength {:.2})",
            signal.action,
            worker.key,
            price,
            signal.strength
        );
        self.engine
            .store()
            .record(signal.id, EventPayload::SignalGenerated { signal: signal.clone() })
            .await?;

        self.route(worker, &signal, price).await
    }

    /// Turn a signal into an entry or an exit, check it and hand it to the engine.
    ///
    /// A pending risk exit pre-empts strategy signals on the same position.
    async fn route(&self, worker: &TupleWorker, signal: &Signal, price: Decimal) -> anyhow::Result<TickOutcome> {
        let key = &worker.key;
        let side = match signal.action {
            SignalAction::Buy => OrderSide::Buy,
            SignalAction::Sell => OrderSide::Sell,
            SignalAction::Hold => return Ok(TickOutcome::Hold),
        };

        let open = self.engine.store().open_position_for(key).await;
        let (directive, notional) = match open {
            Some(position) => match exit_for(&position, side) {
                Ok(exit) => (OrderDirective::Exit(exit), position.notional()),
                Err(reason) => {
                    tracing::debug!("{}: {} signal ignored, {}", key, signal.action, reason);
                    return Ok(TickOutcome::Ignored(reason));
                }
            },
            None => {
                if side == OrderSide::Sell && !self.evaluator.policy().allow_short {
                    tracing::debug!("{}: sell signal ignored, no position and shorting disabled", key);
                    return Ok(TickOutcome::Ignored("no position to close".to_string()));
                }
                let quantity = self.entry_quantity(key, signal, price).await;
                if quantity <= Decimal::ZERO {
                    tracing::warn!("⚠️  {}: position size rounds to zero at {}", key, price);
                    return Ok(TickOutcome::Ignored("position size rounds to zero".to_string()));
                }
                let entry = EntryOrder::market(key.clone(), side, quantity).with_signal(signal.id);
                (OrderDirective::Entry(entry), quantity * price)
            }
        };

        let candidate = TradeCandidate {
            signal_id: signal.id,
            key: key.clone(),
            action: signal.action,
            notional,
            is_exit: matches!(directive, OrderDirective::Exit(_)),
        };
        let reservation = match self.evaluator.pre_trade(&candidate).await? {
            PreTradeDecision::Approved(reservation) => reservation,
            PreTradeDecision::Rejected { rule, .. } => return Ok(TickOutcome::Rejected(rule)),
        };

        // The submission runs in its own task so a cancelled tick never abandons an
        // order already sent to the venue.
        let engine = self.engine.clone();
        let submission = tokio::spawn(async move {
            let _reservation = reservation;
            engine.submit(directive).await
        });
        let result = submission.await.context("order submission task")?;

        match result {
            Ok(outcome) => {
                tracing::info!("✅ {} order {} resolved: {}", key, outcome.order.id, outcome.order.status);
                Ok(TickOutcome::Submitted {
                    order_id: outcome.order.id,
                    status: outcome.order.status,
                })
            }
            Err(e) if e.is_consistency_violation() || matches!(e, ExecutionError::ShuttingDown) => {
                tracing::warn!("⚠️  {} order refused: {}", key, e);
                Ok(TickOutcome::Refused(e.to_string()))
            }
            Err(e @ (ExecutionError::EventLog(_) | ExecutionError::Repository(_))) => Err(e.into()),
            Err(e) => {
                tracing::error!("❌ {} order failed: {}", key, e);
                Ok(TickOutcome::OrderFailed(e.to_string()))
            }
        }
    }

    /// Explicit quantity from the signal, otherwise `max_position_size_pct` of equity.
    async fn entry_quantity(&self, key: &TradingKey, signal: &Signal, price: Decimal) -> Decimal {
        if let Some(quantity) = signal.quantity_hint() {
            return quantity;
        }
        if price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let mut prices = PriceBook::new();
        prices.insert((key.venue.clone(), key.pair.clone()), price);
        let equity = self.evaluator.equity(&prices).await;
        (equity * self.evaluator.policy().max_position_size_pct / Decimal::ONE_HUNDRED / price).round_dp(8)
    }
}

fn exit_for(position: &Position, side: OrderSide) -> Result<ExitOrder, String> {
    if side != position.side.exit_side() {
        return Err(format!("already {}", position.side.as_str()));
    }
    if position.risk_state() != RiskState::Monitoring {
        return Err("exit already pending".to_string());
    }
    Ok(ExitOrder {
        position_id: position.id,
        reason: ExitReason::Strategy,
        quantity: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::events::{EventLog, EventLogConfig, EventType};
    use crate::exchange::{ExchangeRegistry, PaperExchange};
    use crate::execution::{ExecutionConfig, InFlightTable, PositionStore};
    use crate::models::{Candle, Parameters, PositionStatus, Timeframe};
    use crate::persistence::InMemoryStore;
    use crate::risk::RiskPolicy;
    use crate::shutdown::ShutdownReason;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rust_decimal_macros::dec;

    fn candles(closes: &[Decimal]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                timestamp: start + ChronoDuration::hours(i as i64),
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: dec!(1000),
            })
            .collect()
    }

    // Steady decline: RSI near zero
    fn falling(to: Decimal) -> Vec<Candle> {
        let closes: Vec<Decimal> = (0..30).rev().map(|i| to + Decimal::from(i)).collect();
        candles(&closes)
    }

    // Steady rise: RSI near 100
    fn rising(to: Decimal) -> Vec<Candle> {
        let closes: Vec<Decimal> = (0..30).rev().map(|i| to - Decimal::from(i)).collect();
        candles(&closes)
    }

    // Alternating moves: RSI near 50
    fn sideways(around: Decimal) -> Vec<Candle> {
        let closes: Vec<Decimal> = (0..30)
            .map(|i| if i % 2 == 0 { around } else { around + Decimal::ONE })
            .collect();
        candles(&closes)
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        paper: Arc<PaperExchange>,
        store: Arc<PositionStore>,
        shutdown: Shutdown,
    }

    fn harness(policy: RiskPolicy) -> Harness {
        let paper = Arc::new(
            PaperExchange::new("paper", 11)
                .with_market("BTC/USDT", dec!(100))
                .with_volatility(0.0),
        );
        let mut registry = ExchangeRegistry::new();
        registry.register(paper.clone(), None);

        let shutdown = Shutdown::new();
        let repo = Arc::new(InMemoryStore::new());
        let log = EventLog::new(repo.clone(), EventLogConfig::default(), shutdown.clone());
        let store = Arc::new(PositionStore::new(repo.clone(), repo, log));
        let policy = Arc::new(policy);
        let in_flight = InFlightTable::new();
        let execution = ExecutionConfig {
            status_poll_interval_ms: 10,
            drain_timeout_secs: 1,
            ..ExecutionConfig::default()
        };
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(registry),
            store.clone(),
            policy.clone(),
            in_flight.clone(),
            execution.clone(),
        ));
        let evaluator = Arc::new(RiskEvaluator::new(
            policy,
            store.clone(),
            in_flight,
            dec!(10000),
            execution.order_timeout(),
            execution.max_exit_retry_rounds,
        ));
        let monitor = Arc::new(RiskMonitor::new(
            evaluator.clone(),
            engine.clone(),
            Duration::from_secs(1),
        ));

        let tuple = StrategyTuple {
            id: "t1".to_string(),
            strategy: "rsi_mean_reversion".to_string(),
            pair: "BTC/USDT".to_string(),
            timeframe: Timeframe::H1,
            venue: "paper".to_string(),
            parameters: Parameters::new(),
            enabled: true,
        };
        let config = OrchestratorConfig {
            shutdown_grace_secs: 1,
            ..OrchestratorConfig::default()
        };
        let orchestrator = Orchestrator::new(
            config,
            &[tuple],
            &Plugins::builtin(),
            evaluator,
            engine,
            monitor,
            shutdown.clone(),
        )
        .unwrap();

        Harness {
            orchestrator: Arc::new(orchestrator),
            paper,
            store,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_buy_signal_opens_sized_position() {
        let h = harness(RiskPolicy::default());
        h.paper.set_candles("BTC/USDT", falling(dec!(100)));

        let outcome = h.orchestrator.force("t1").await.unwrap();
        assert!(matches!(outcome, TickOutcome::Submitted { status: OrderStatus::Filled, .. }));

        let position = h
            .store
            .open_position_for(&TradingKey::new("t1", "BTC/USDT", "paper"))
            .await
            .unwrap();
        // 10% of 10,000 at 100
        assert_eq!(position.quantity, dec!(10));

        let generated = h.store.log().recent(EventType::SignalGenerated, 10).await.unwrap();
        assert_eq!(generated.len(), 1);
    }

    #[tokio::test]
    async fn test_hold_records_nothing() {
        let h = harness(RiskPolicy::default());
        h.paper.set_candles("BTC/USDT", sideways(dec!(100)));

        assert_eq!(h.orchestrator.force("t1").await.unwrap(), TickOutcome::Hold);
        let generated = h.store.log().recent(EventType::SignalGenerated, 10).await.unwrap();
        assert!(generated.is_empty());
        assert_eq!(h.paper.create_order_calls(), 0);
    }

    #[tokio::test]
    async fn test_sell_signal_closes_long() {
        let h = harness(RiskPolicy::default());
        h.paper.set_candles("BTC/USDT", falling(dec!(100)));
        h.orchestrator.force("t1").await.unwrap();

        h.paper.set_candles("BTC/USDT", rising(dec!(101)));
        let outcome = h.orchestrator.force("t1").await.unwrap();
        assert!(matches!(outcome, TickOutcome::Submitted { status: OrderStatus::Filled, .. }));

        let key = TradingKey::new("t1", "BTC/USDT", "paper");
        assert!(h.store.open_position_for(&key).await.is_none());
        assert_eq!(h.store.realized_pnl().await, dec!(10));
    }

    #[tokio::test]
    async fn test_repeated_buy_is_ignored_while_long() {
        let h = harness(RiskPolicy::default());
        h.paper.set_candles("BTC/USDT", falling(dec!(100)));
        h.orchestrator.force("t1").await.unwrap();

        let outcome = h.orchestrator.force("t1").await.unwrap();
        assert_eq!(outcome, TickOutcome::Ignored("already long".to_string()));
        assert_eq!(h.paper.create_order_calls(), 1);
    }

    #[tokio::test]
    async fn test_sell_when_flat_needs_shorting() {
        let h = harness(RiskPolicy::default());
        h.paper.set_candles("BTC/USDT", rising(dec!(100)));
        assert!(matches!(
            h.orchestrator.force("t1").await.unwrap(),
            TickOutcome::Ignored(_)
        ));

        let h = harness(RiskPolicy {
            allow_short: true,
            ..RiskPolicy::default()
        });
        h.paper.set_candles("BTC/USDT", rising(dec!(100)));
        h.orchestrator.force("t1").await.unwrap();
        let position = h
            .store
            .open_position_for(&TradingKey::new("t1", "BTC/USDT", "paper"))
            .await
            .unwrap();
        assert_eq!(position.side.as_str(), "short");
    }

    #[tokio::test]
    async fn test_exposure_rejection_places_no_order() {
        let mut policy = RiskPolicy::default();
        policy.exposure.max_per_asset = dec!(500);
        let h = harness(policy);
        h.paper.set_candles("BTC/USDT", falling(dec!(100)));

        let outcome = h.orchestrator.force("t1").await.unwrap();
        assert_eq!(outcome, TickOutcome::Rejected(RiskRule::MaxPerAsset));
        assert_eq!(h.paper.create_order_calls(), 0);

        let breaches = h.store.log().recent(EventType::ExposureLimitBreached, 10).await.unwrap();
        assert_eq!(breaches.len(), 1);
    }

    #[tokio::test]
    async fn test_consecutive_failures_cool_down() {
        let h = harness(RiskPolicy::default());
        h.paper.inject_market_data_faults(vec![
            ExchangeError::Network("reset".into()),
            ExchangeError::Network("reset".into()),
            ExchangeError::Network("reset".into()),
        ]);

        for _ in 0..3 {
            assert!(matches!(
                h.orchestrator.force("t1").await.unwrap(),
                TickOutcome::Failed(_)
            ));
        }
        assert!(matches!(
            h.orchestrator.force("t1").await.unwrap(),
            TickOutcome::CoolingDown(_)
        ));
        assert_eq!(h.paper.create_order_calls(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let h = harness(RiskPolicy::default());
        h.paper.set_candles("BTC/USDT", sideways(dec!(100)));
        h.paper.set_latency(Duration::from_millis(100));

        let (a, b) = tokio::join!(h.orchestrator.force("t1"), h.orchestrator.force("t1"));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| **o == TickOutcome::Skipped).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == TickOutcome::Hold).count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tuple() {
        let h = harness(RiskPolicy::default());
        assert!(h.orchestrator.force("nope").await.is_err());
        assert_eq!(h.orchestrator.tuple_ids(), vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(RiskPolicy::default());
        let running = tokio::spawn(h.orchestrator.clone().run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.shutdown.trigger(ShutdownReason::Requested);

        let unreconciled = running.await.unwrap().unwrap();
        assert_eq!(unreconciled, 0);
        assert!(h.orchestrator.engine().is_draining());
    }

    #[tokio::test]
    async fn test_risk_exit_preempts_strategy_exit() {
        let h = harness(RiskPolicy::default());
        h.paper.set_candles("BTC/USDT", falling(dec!(100)));
        h.orchestrator.force("t1").await.unwrap();

        let key = TradingKey::new("t1", "BTC/USDT", "paper");
        let position = h.store.open_position_for(&key).await.unwrap();
        h.store
            .commit_position(
                position.id,
                EventPayload::ExitRequested {
                    reason: ExitReason::StopLoss,
                    quantity: None,
                },
            )
            .await
            .unwrap();

        h.paper.set_candles("BTC/USDT", rising(dec!(101)));
        let outcome = h.orchestrator.force("t1").await.unwrap();
        assert_eq!(outcome, TickOutcome::Ignored("exit already pending".to_string()));
        let current = h.store.position(position.id).await.unwrap().unwrap();
        assert_eq!(current.status, PositionStatus::Open);
    }
}
