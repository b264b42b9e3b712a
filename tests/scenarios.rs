use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tradebot::error::ExchangeError;
use tradebot::events::{Aggregate, EventLog, EventLogConfig, EventType};
use tradebot::exchange::{ExchangeRegistry, PaperExchange};
use tradebot::execution::{
    EntryOrder, ExecutionConfig, ExecutionEngine, ExitOrder, InFlightTable, OrderDirective,
    PositionStore, RetryPolicy,
};
use tradebot::orchestrator::{Orchestrator, OrchestratorConfig, Plugins, StrategyTuple, TickOutcome};
use tradebot::persistence::InMemoryStore;
use tradebot::risk::{
    PreTradeDecision, PriceBook, RiskEvaluator, RiskMonitor, RiskPolicy, RiskRule, TradeCandidate,
};
use tradebot::shutdown::Shutdown;
use tradebot::{
    Candle, ExitReason, Order, OrderSide, OrderStatus, Parameters, Position, PositionStatus,
    SignalAction, Timeframe, TradingKey,
};
use uuid::Uuid;

struct Harness {
    paper: Arc<PaperExchange>,
    store: Arc<PositionStore>,
    engine: Arc<ExecutionEngine>,
    evaluator: Arc<RiskEvaluator>,
    monitor: Arc<RiskMonitor>,
    shutdown: Shutdown,
}

fn execution_config() -> ExecutionConfig {
    ExecutionConfig {
        order_timeout_secs: 5,
        status_poll_interval_ms: 10,
        retry: RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 1,
            max_delay_ms: 10,
            jitter: 0.0,
        },
        ..ExecutionConfig::default()
    }
}

fn harness(policy: RiskPolicy) -> Harness {
    let paper = Arc::new(
        PaperExchange::new("paper", 42)
            .with_market("BTC/USDT", dec!(100))
            .with_market("ETH/USDT", dec!(100))
            .with_market("SOL/USDT", dec!(100))
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
    let config = execution_config();
    let engine = Arc::new(ExecutionEngine::new(
        Arc::new(registry),
        store.clone(),
        policy.clone(),
        in_flight.clone(),
        config.clone(),
    ));
    let evaluator = Arc::new(RiskEvaluator::new(
        policy,
        store.clone(),
        in_flight,
        dec!(10000),
        config.order_timeout(),
        config.max_exit_retry_rounds,
    ));
    let monitor = Arc::new(RiskMonitor::new(
        evaluator.clone(),
        engine.clone(),
        Duration::from_secs(1),
    ));

    Harness {
        paper,
        store,
        engine,
        evaluator,
        monitor,
        shutdown,
    }
}

async fn open(h: &Harness, strategy: &str, pair: &str, quantity: Decimal) -> Position {
    let key = TradingKey::new(strategy, pair, "paper");
    h.engine
        .submit(OrderDirective::Entry(EntryOrder::market(key, OrderSide::Buy, quantity)))
        .await
        .expect("entry should fill")
        .position
        .expect("entry should open a position")
}

fn prices(entries: &[(&str, Decimal)]) -> PriceBook {
    entries
        .iter()
        .map(|(pair, price)| (("paper".to_string(), pair.to_string()), *price))
        .collect()
}

async fn count(h: &Harness, event_type: EventType) -> usize {
    h.store.log().recent(event_type, 1_000).await.unwrap().len()
}

#[tokio::test]
async fn scenario_a_stop_loss_threshold() {
    let h = harness(RiskPolicy::default());
    let position = open(&h, "s1", "BTC/USDT", dec!(1)).await;
    assert_eq!(position.entry_price, dec!(100));

    let report = h.evaluator.sweep(&prices(&[("BTC/USDT", dec!(98.5))])).await.unwrap();
    assert!(report.directives.is_empty());
    assert_eq!(count(&h, EventType::StopLossTriggered).await, 0);

    let report = h.evaluator.sweep(&prices(&[("BTC/USDT", dec!(97.9))])).await.unwrap();
    assert_eq!(report.directives.len(), 1);
    assert_eq!(report.directives[0].position_id, position.id);
    assert_eq!(report.directives[0].reason, ExitReason::StopLoss);
    assert_eq!(count(&h, EventType::StopLossTriggered).await, 1);
}

#[tokio::test]
async fn scenario_b_concurrency_limit_blocks_third_trade() {
    let h = harness(RiskPolicy {
        max_concurrent_trades: 2,
        ..RiskPolicy::default()
    });
    open(&h, "s1", "BTC/USDT", dec!(1)).await;
    open(&h, "s2", "ETH/USDT", dec!(1)).await;

    let candidate = TradeCandidate {
        signal_id: Uuid::new_v4(),
        key: TradingKey::new("s3", "SOL/USDT", "paper"),
        action: SignalAction::Buy,
        notional: dec!(100),
        is_exit: false,
    };
    match h.evaluator.pre_trade(&candidate).await.unwrap() {
        PreTradeDecision::Rejected { rule, .. } => assert_eq!(rule, RiskRule::MaxConcurrentTrades),
        PreTradeDecision::Approved(_) => panic!("third trade must be rejected"),
    }
    assert_eq!(h.paper.create_order_calls(), 2);
    assert_eq!(count(&h, EventType::SignalRejected).await, 1);
    assert_eq!(count(&h, EventType::OrderSubmitted).await, 2);
}

#[tokio::test]
async fn scenario_c_timeouts_then_success() {
    let h = harness(RiskPolicy::default());
    h.paper.inject_order_faults(vec![
        ExchangeError::Timeout(Duration::from_secs(1)),
        ExchangeError::Timeout(Duration::from_secs(1)),
        ExchangeError::Timeout(Duration::from_secs(1)),
    ]);

    let position = open(&h, "s1", "BTC/USDT", dec!(1)).await;
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(h.paper.create_order_calls(), 4);
    assert_eq!(h.paper.order_count(), 1);
    assert_eq!(count(&h, EventType::OrderSubmitted).await, 1);
    assert_eq!(count(&h, EventType::OrderFilled).await, 1);
    assert_eq!(count(&h, EventType::OrderFailed).await, 0);
}

#[tokio::test]
async fn scenario_d_emergency_exit_once_per_position() {
    let h = harness(RiskPolicy::default());
    open(&h, "s1", "BTC/USDT", dec!(25)).await;
    open(&h, "s2", "ETH/USDT", dec!(25)).await;

    // 2 x 25 x 45 = 2,250 lost from 10,000: 22.5% drawdown
    let crash = prices(&[("BTC/USDT", dec!(55)), ("ETH/USDT", dec!(55))]);
    let report = h.evaluator.sweep(&crash).await.unwrap();
    assert!(report.emergency);
    assert_eq!(report.directives.len(), 2);
    assert!(report
        .directives
        .iter()
        .all(|d| d.reason == ExitReason::EmergencyExit));
    assert!(h.evaluator.is_emergency_only());

    let again = h.evaluator.sweep(&crash).await.unwrap();
    assert!(again.directives.is_empty());
    assert_eq!(count(&h, EventType::EmergencyExitTriggered).await, 2);
    assert_eq!(count(&h, EventType::DrawdownBreached).await, 1);

    // New entries are refused while positions unwind
    let candidate = TradeCandidate {
        signal_id: Uuid::new_v4(),
        key: TradingKey::new("s3", "SOL/USDT", "paper"),
        action: SignalAction::Buy,
        notional: dec!(100),
        is_exit: false,
    };
    assert!(!h.evaluator.pre_trade(&candidate).await.unwrap().is_approved());
}

fn falling_candles() -> Vec<Candle> {
    let start = chrono::DateTime::from_timestamp(1_704_067_200, 0).unwrap();
    (0..30)
        .map(|i| {
            let close = Decimal::from(130 - i);
            Candle {
                timestamp: start + chrono::Duration::hours(i),
                open: close,
                high: close,
                low: close,
                close,
                volume: dec!(1000),
            }
        })
        .collect()
}

#[tokio::test]
async fn scenario_e_overlapping_tick_is_skipped() {
    let h = harness(RiskPolicy::default());
    h.paper.set_candles("BTC/USDT", falling_candles());
    h.paper.set_latency(Duration::from_millis(100));

    let tuple = StrategyTuple {
        id: "btc-rsi".to_string(),
        strategy: "rsi_mean_reversion".to_string(),
        pair: "BTC/USDT".to_string(),
        timeframe: Timeframe::H1,
        venue: "paper".to_string(),
        parameters: Parameters::new(),
        enabled: true,
    };
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        &[tuple],
        &Plugins::builtin(),
        h.evaluator.clone(),
        h.engine.clone(),
        h.monitor.clone(),
        h.shutdown.clone(),
    )
    .unwrap();

    let (first, second) = tokio::join!(orchestrator.force("btc-rsi"), orchestrator.force("btc-rsi"));
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| **o == TickOutcome::Skipped).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, TickOutcome::Submitted { status: OrderStatus::Filled, .. }))
            .count(),
        1
    );
    // Only the tick that ran reached the venue
    assert_eq!(h.paper.create_order_calls(), 1);
}

#[tokio::test]
async fn replay_reproduces_stored_state() {
    let h = harness(RiskPolicy::default());
    let position = open(&h, "s1", "BTC/USDT", dec!(2)).await;

    h.paper.set_price("BTC/USDT", dec!(104));
    let outcome = h
        .engine
        .submit(OrderDirective::Exit(ExitOrder {
            position_id: position.id,
            reason: ExitReason::Manual,
            quantity: Some(dec!(0.5)),
        }))
        .await
        .unwrap();

    let stored = h.store.position(position.id).await.unwrap().unwrap();
    let history = h.store.log().history(position.id).await.unwrap();
    let replayed = Position::fold(&history).unwrap().unwrap();
    assert_eq!(replayed, stored);
    assert_eq!(replayed.quantity, dec!(1.5));

    let stored_order = h.store.order(outcome.order.id).await.unwrap().unwrap();
    let order_history = h.store.log().history(outcome.order.id).await.unwrap();
    let replayed_order = Order::fold(&order_history).unwrap().unwrap();
    assert_eq!(replayed_order, stored_order);
    assert_eq!(replayed_order.status, OrderStatus::Filled);

    // Sequences are 1-based and gap-free per aggregate
    let sequences: Vec<i64> = history.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=history.len() as i64).collect::<Vec<_>>());
}

#[tokio::test]
async fn sweep_is_idempotent_while_exit_pending() {
    let h = harness(RiskPolicy::default());
    open(&h, "s1", "BTC/USDT", dec!(1)).await;
    open(&h, "s2", "ETH/USDT", dec!(1)).await;

    let book = prices(&[("BTC/USDT", dec!(90)), ("ETH/USDT", dec!(110))]);
    let first = h.evaluator.sweep(&book).await.unwrap();
    let second = h.evaluator.sweep(&book).await.unwrap();

    assert_eq!(first.directives.len(), 2);
    assert!(second.directives.is_empty());
    assert_eq!(count(&h, EventType::ExitRequested).await, 2);
}

#[tokio::test]
async fn monitor_closes_position_end_to_end() {
    let h = harness(RiskPolicy::default());
    let position = open(&h, "s1", "BTC/USDT", dec!(1)).await;

    h.paper.set_price("BTC/USDT", dec!(106));
    h.monitor.run_once().await.unwrap();

    let mut closed = None;
    for _ in 0..200 {
        let current = h.store.position(position.id).await.unwrap().unwrap();
        if current.status == PositionStatus::Closed {
            closed = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let closed = closed.expect("take profit should close the position");
    assert_eq!(closed.exit_reason, Some(ExitReason::TakeProfit));
    assert_eq!(closed.realized_pnl, dec!(6));
    assert_eq!(count(&h, EventType::TakeProfitTriggered).await, 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    // Ratchet holds across whole sweeps, not just single updates
    #[test]
    fn trailing_stop_never_worsens(moves in prop::collection::vec(-300i64..400, 1..20)) {
        tokio_test::block_on(async {
            let h = harness(RiskPolicy {
                trailing_stop: tradebot::risk::TrailingStopConfig {
                    enabled: true,
                    trailing_pct: dec!(2),
                    activation_pct: dec!(3),
                },
                stop_loss: tradebot::risk::StopLossConfig {
                    enabled: false,
                    ..Default::default()
                },
                take_profit: tradebot::risk::TakeProfitConfig {
                    enabled: false,
                    ..Default::default()
                },
                ..RiskPolicy::default()
            });
            let position = open(&h, "s1", "BTC/USDT", dec!(1)).await;

            let mut last_stop: Option<Decimal> = None;
            for m in moves {
                let price = dec!(100) + Decimal::new(m, 1);
                if price <= Decimal::ZERO {
                    continue;
                }
                h.evaluator.sweep(&prices(&[("BTC/USDT", price)])).await.unwrap();
                let current = h.store.position(position.id).await.unwrap().unwrap();
                if let (Some(previous), Some(stop)) = (last_stop, current.trailing_stop_price) {
                    assert!(stop >= previous, "stop moved from {} to {}", previous, stop);
                }
                if current.trailing_stop_price.is_some() {
                    last_stop = current.trailing_stop_price;
                }
                if current.status == PositionStatus::Closed {
                    break;
                }
            }
        });
    }
}
