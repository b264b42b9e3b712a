use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::evaluator::{PriceBook, RiskEvaluator, SweepReport};
use crate::error::ExecutionError;
use crate::execution::{ExecutionEngine, ExitOrder, OrderDirective};
use crate::models::{ExitReason, TradingKey};
use crate::shutdown::Shutdown;

const HISTORY_LIMIT: usize = 1_000;

/// One exit the sweep raised.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerRecord {
    pub position_id: Uuid,
    pub key: TradingKey,
    pub reason: ExitReason,
    pub quantity: Option<Decimal>,
    pub at: DateTime<Utc>,
}

/// One sweep evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct SweepRecord {
    pub at: DateTime<Utc>,
    pub evaluated: usize,
    pub equity: Decimal,
    pub drawdown_pct: Decimal,
    pub emergency: bool,
    pub released: usize,
    pub triggers: Vec<TriggerRecord>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStats {
    pub sweeps: u64,
    pub failed_sweeps: u64,
    pub price_failures: u64,
    pub triggers: HashMap<ExitReason, u64>,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub last_equity: Option<Decimal>,
    pub last_drawdown_pct: Option<Decimal>,
}

/// Runs the risk sweep on a fixed interval and hands exits to the execution engine.
pub struct RiskMonitor {
    evaluator: Arc<RiskEvaluator>,
    engine: Arc<ExecutionEngine>,
    interval: Duration,
    price_timeout: Duration,
    history: Mutex<VecDeque<SweepRecord>>,
    stats: Mutex<MonitorStats>,
}

impl RiskMonitor {
    pub fn new(evaluator: Arc<RiskEvaluator>, engine: Arc<ExecutionEngine>, price_timeout: Duration) -> Self {
        let interval = evaluator.policy().risk_check_interval();
        Self {
            evaluator,
            engine,
            interval,
            price_timeout,
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(MonitorStats::default()),
        }
    }

    /// Sweep every `risk_check_interval` until shutdown. A slow sweep skips missed ticks
    /// instead of bunching them.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        tracing::info!("🛡️  Risk monitor started (every {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                reason = shutdown.wait() => {
                    tracing::info!("Risk monitor stopping ({:?})", reason);
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        if let Ok(mut stats) = self.stats.lock() {
                            stats.failed_sweeps += 1;
                        }
                        tracing::error!("❌ Risk sweep failed: {}", e);
                    }
                }
            }
        }
    }

    /// One sweep. Exits are submitted in the background so a slow venue never delays
    /// the next sweep.
    pub async fn run_once(&self) -> Result<SweepReport, ExecutionError> {
        let prices = self.fetch_prices().await;
        let report = self.evaluator.sweep(&prices).await?;
        self.record(&report);

        if !report.directives.is_empty() || report.released > 0 {
            tracing::info!(
                "Risk sweep: {} positions, {} exits, {} released (equity {}, drawdown {}%)",
                report.evaluated,
                report.directives.len(),
                report.released,
                report.equity.round_dp(2),
                report.drawdown_pct.round_dp(2)
            );
        } else {
            tracing::debug!(
                "Risk sweep: {} positions, equity {}, drawdown {}%",
                report.evaluated,
                report.equity.round_dp(2),
                report.drawdown_pct.round_dp(2)
            );
        }

        for directive in &report.directives {
            let engine = self.engine.clone();
            let key = directive.key.clone();
            let exit = ExitOrder {
                position_id: directive.position_id,
                reason: directive.reason,
                quantity: directive.quantity,
            };
            tokio::spawn(async move {
                let reason = exit.reason;
                match engine.submit(OrderDirective::Exit(exit)).await {
                    Ok(outcome) => tracing::debug!("{} exit for {} resolved: {}", reason, key, outcome.order.status),
                    Err(e) if e.is_consistency_violation() => {
                        tracing::warn!("⚠️  {} exit for {} skipped: {}", reason, key, e)
                    }
                    Err(ExecutionError::ShuttingDown) => {
                        tracing::warn!("⚠️  {} exit for {} dropped during shutdown", reason, key)
                    }
                    Err(e) => tracing::error!("❌ {} exit for {} failed: {}", reason, key, e),
                }
            });
        }
        Ok(report)
    }

    /// Last prices for every (venue, pair) with an open position. Pairs whose ticker
    /// cannot be fetched are left out and their positions skip this sweep.
    async fn fetch_prices(&self) -> PriceBook {
        let markets: BTreeSet<(String, String)> = self
            .engine
            .store()
            .open_positions()
            .await
            .into_iter()
            .map(|p| (p.venue, p.pair))
            .collect();

        let exchanges = self.engine.exchanges();
        let fetches = markets.into_iter().map(|(venue, pair)| async move {
            let result = match exchanges.get(&venue) {
                Some(client) => client
                    .fetch_ticker(&pair, self.price_timeout)
                    .await
                    .map(|t| t.last)
                    .map_err(|e| e.to_string()),
                None => Err(format!("unknown venue '{}'", venue)),
            };
            (venue, pair, result)
        });

        let mut prices = PriceBook::new();
        let mut failures = 0;
        for (venue, pair, result) in join_all(fetches).await {
            match result {
                Ok(price) => {
                    prices.insert((venue, pair), price);
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("⚠️  No price for {} on {}: {}", pair, venue, e);
                }
            }
        }
        if failures > 0 {
            if let Ok(mut stats) = self.stats.lock() {
                stats.price_failures += failures;
            }
        }
        prices
    }

    fn record(&self, report: &SweepReport) {
        let now = Utc::now();
        if let Ok(mut stats) = self.stats.lock() {
            stats.sweeps += 1;
            stats.last_sweep_at = Some(now);
            stats.last_equity = Some(report.equity);
            stats.last_drawdown_pct = Some(report.drawdown_pct);
            for directive in &report.directives {
                *stats.triggers.entry(directive.reason).or_insert(0) += 1;
            }
        }

        let triggers = report
            .directives
            .iter()
            .map(|directive| TriggerRecord {
                position_id: directive.position_id,
                key: directive.key.clone(),
                reason: directive.reason,
                quantity: directive.quantity,
                at: now,
            })
            .collect();
        if let Ok(mut history) = self.history.lock() {
            history.push_back(SweepRecord {
                at: now,
                evaluated: report.evaluated,
                equity: report.equity,
                drawdown_pct: report.drawdown_pct,
                emergency: report.emergency,
                released: report.released,
                triggers,
            });
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
    }

    /// Most recent sweeps, newest last.
    pub fn history(&self, limit: usize) -> Vec<SweepRecord> {
        self.history
            .lock()
            .map(|h| h.iter().skip(h.len().saturating_sub(limit)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn statistics(&self) -> MonitorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventLog, EventLogConfig};
    use crate::exchange::{ExchangeRegistry, PaperExchange};
    use crate::execution::{EntryOrder, ExecutionConfig, InFlightTable, PositionStore};
    use crate::models::{OrderSide, PositionStatus};
    use crate::persistence::InMemoryStore;
    use crate::risk::RiskPolicy;
    use rust_decimal_macros::dec;

    async fn setup() -> (Arc<RiskMonitor>, Arc<ExecutionEngine>, Arc<PaperExchange>) {
        let paper = Arc::new(
            PaperExchange::new("paper", 3)
                .with_market("BTC/USDT", dec!(100))
                .with_volatility(0.0),
        );
        let mut registry = ExchangeRegistry::new();
        registry.register(paper.clone(), None);

        let repo = Arc::new(InMemoryStore::new());
        let log = EventLog::new(repo.clone(), EventLogConfig::default(), Shutdown::new());
        let store = Arc::new(PositionStore::new(repo.clone(), repo, log));
        let policy = Arc::new(RiskPolicy::default());
        let in_flight = InFlightTable::new();
        let config = ExecutionConfig {
            status_poll_interval_ms: 10,
            ..ExecutionConfig::default()
        };
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(registry),
            store.clone(),
            policy.clone(),
            in_flight.clone(),
            config.clone(),
        ));
        let evaluator = Arc::new(RiskEvaluator::new(
            policy,
            store,
            in_flight,
            dec!(10000),
            config.order_timeout(),
            config.max_exit_retry_rounds,
        ));
        let monitor = Arc::new(RiskMonitor::new(evaluator, engine.clone(), Duration::from_secs(1)));
        (monitor, engine, paper)
    }

    #[tokio::test]
    async fn test_stop_loss_exit_is_executed() {
        let (monitor, engine, paper) = setup().await;
        let key = TradingKey::new("s1", "BTC/USDT", "paper");
        let position = engine
            .submit(OrderDirective::Entry(EntryOrder::market(key, OrderSide::Buy, dec!(1))))
            .await
            .unwrap()
            .position
            .unwrap();

        paper.set_price("BTC/USDT", dec!(97));
        let report = monitor.run_once().await.unwrap();
        assert_eq!(report.directives.len(), 1);

        let mut closed = None;
        for _ in 0..100 {
            let current = engine.store().position(position.id).await.unwrap().unwrap();
            if current.status == PositionStatus::Closed {
                closed = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let closed = closed.expect("position should close");
        assert_eq!(closed.exit_reason, Some(ExitReason::StopLoss));
        assert_eq!(closed.realized_pnl, dec!(-3));

        let stats = monitor.statistics();
        assert_eq!(stats.sweeps, 1);
        assert_eq!(stats.triggers.get(&ExitReason::StopLoss), Some(&1));
        let history = monitor.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].triggers.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_price_skips_position() {
        let (monitor, engine, paper) = setup().await;
        let key = TradingKey::new("s1", "BTC/USDT", "paper");
        engine
            .submit(OrderDirective::Entry(EntryOrder::market(key, OrderSide::Buy, dec!(1))))
            .await
            .unwrap();

        paper.set_price("BTC/USDT", dec!(50));
        paper.inject_market_data_faults(vec![crate::error::ExchangeError::Network("down".into())]);
        let report = monitor.run_once().await.unwrap();
        assert!(report.directives.is_empty());
        assert_eq!(monitor.statistics().price_failures, 1);
    }
}
