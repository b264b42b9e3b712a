use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::drawdown::{DrawdownSnapshot, DrawdownTracker};
use super::policy::RiskPolicy;
use crate::error::ExecutionError;
use crate::events::{EventPayload, EventType, PORTFOLIO_AGGREGATE_ID};
use crate::execution::{InFlightTable, PositionStore};
use crate::models::{base_asset, ExitReason, Position, RiskState, SignalAction, TradingKey};

/// Last known prices keyed by (venue, pair).
pub type PriceBook = HashMap<(String, String), Decimal>;

/// Pre-trade rule that can reject a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRule {
    MaxConcurrentTrades,
    MaxPerAssetTrades,
    MaxPerAsset,
    MaxPerExchange,
    MaxTotalExposure,
    EmergencyOnly,
}

impl RiskRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskRule::MaxConcurrentTrades => "max_concurrent_trades",
            RiskRule::MaxPerAssetTrades => "max_per_asset_trades",
            RiskRule::MaxPerAsset => "max_per_asset",
            RiskRule::MaxPerExchange => "max_per_exchange",
            RiskRule::MaxTotalExposure => "max_total_exposure",
            RiskRule::EmergencyOnly => "emergency_only",
        }
    }
}

impl fmt::Display for RiskRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signal about to become an order.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeCandidate {
    pub signal_id: Uuid,
    pub key: TradingKey,
    pub action: SignalAction,
    /// Prospective entry notional in the base currency
    pub notional: Decimal,
    pub is_exit: bool,
}

#[derive(Debug)]
pub enum PreTradeDecision {
    /// Entries carry a reservation that counts toward limits until the order resolves.
    Approved(Option<ExposureReservation>),
    Rejected { rule: RiskRule, reason: String },
}

impl PreTradeDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, PreTradeDecision::Approved(_))
    }
}

#[derive(Debug, Clone)]
struct Reserved {
    key: TradingKey,
    notional: Decimal,
}

/// Approved entry that has not opened a position yet. Dropping it frees the capacity.
#[derive(Debug)]
pub struct ExposureReservation {
    id: Uuid,
    table: Arc<StdMutex<HashMap<Uuid, Reserved>>>,
}

impl Drop for ExposureReservation {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        table.remove(&self.id);
    }
}

/// Exit the sweep wants the execution engine to place.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitDirective {
    pub position_id: Uuid,
    pub key: TradingKey,
    pub reason: ExitReason,
    /// `None` closes the whole position
    pub quantity: Option<Decimal>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub evaluated: usize,
    pub equity: Decimal,
    pub drawdown_pct: Decimal,
    pub directives: Vec<ExitDirective>,
    pub trailing_adjustments: usize,
    pub released: usize,
    pub emergency: bool,
}

/// Equity is re-recorded at least this often even when it has not moved.
const EQUITY_SNAPSHOT_MAX_AGE_SECS: i64 = 3600;

struct SweepState {
    drawdown: DrawdownTracker,
    breach_active: bool,
    last_snapshot: Option<(DateTime<Utc>, Decimal)>,
    emergency_fired: HashSet<Uuid>,
    cooldowns: HashMap<(Uuid, ExitReason), Instant>,
}

/// Pre-trade validation and the periodic position sweep.
pub struct RiskEvaluator {
    policy: Arc<RiskPolicy>,
    store: Arc<PositionStore>,
    in_flight: InFlightTable,
    initial_capital: Decimal,
    order_timeout: Duration,
    max_exit_rounds: u32,
    emergency_only: AtomicBool,
    reservations: Arc<StdMutex<HashMap<Uuid, Reserved>>>,
    pre_trade_lock: Mutex<()>,
    sweep_state: Mutex<SweepState>,
}

impl RiskEvaluator {
    pub fn new(
        policy: Arc<RiskPolicy>,
        store: Arc<PositionStore>,
        in_flight: InFlightTable,
        initial_capital: Decimal,
        order_timeout: Duration,
        max_exit_rounds: u32,
    ) -> Self {
        let drawdown = DrawdownTracker::new(
            initial_capital,
            policy.drawdown.calculation_period_days,
            Utc::now(),
        );
        Self {
            policy,
            store,
            in_flight,
            initial_capital,
            order_timeout,
            max_exit_rounds,
            emergency_only: AtomicBool::new(false),
            reservations: Arc::new(StdMutex::new(HashMap::new())),
            pre_trade_lock: Mutex::new(()),
            sweep_state: Mutex::new(SweepState {
                drawdown,
                breach_active: false,
                last_snapshot: None,
                emergency_fired: HashSet::new(),
                cooldowns: HashMap::new(),
            }),
        }
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    pub fn is_emergency_only(&self) -> bool {
        self.emergency_only.load(Ordering::SeqCst)
    }

    /// Rebuild drawdown and emergency state from the event log after a restart.
    ///
    /// Emergency-only mode survives a restart until an explicit resume: it is set when the
    /// latest pause (a pausing breach or an emergency exit on a still-open position) is newer
    /// than the latest `TradingResumed`. Call after the position store has loaded.
    pub async fn restore(&self) -> Result<(), ExecutionError> {
        let history = self.store.log().history(PORTFOLIO_AGGREGATE_ID).await?;
        let now = Utc::now();

        let mut paused_at: Option<DateTime<Utc>> = None;
        let mut resumed_at: Option<DateTime<Utc>> = None;
        let mut breach_active = false;
        let mut samples = Vec::new();
        for event in &history {
            match &event.payload {
                EventPayload::DrawdownBreached { .. } => {
                    breach_active = true;
                    if self.policy.drawdown.pause_on_breach {
                        paused_at = Some(event.occurred_at);
                    }
                }
                EventPayload::TradingResumed { .. } => resumed_at = Some(event.occurred_at),
                EventPayload::EquitySnapshot {
                    equity,
                    drawdown_pct,
                    ..
                } => {
                    breach_active = breach_active && *drawdown_pct >= self.policy.drawdown.max_drawdown_pct;
                    samples.push((event.occurred_at, *equity));
                }
                _ => {}
            }
        }

        let mut emergency_fired = HashSet::new();
        for position in self.store.open_positions().await {
            let events = self.store.log().history(position.id).await?;
            if let Some(fired) = events
                .iter()
                .rev()
                .find(|e| e.event_type() == EventType::EmergencyExitTriggered)
            {
                emergency_fired.insert(position.id);
                paused_at = paused_at.max(Some(fired.occurred_at));
            }
        }

        let emergency_only = match (paused_at, resumed_at) {
            (Some(paused), Some(resumed)) => paused > resumed,
            (Some(_), None) => true,
            _ => false,
        };
        self.emergency_only.store(emergency_only, Ordering::SeqCst);

        let mut state = self.sweep_state.lock().await;
        state.drawdown = DrawdownTracker::from_samples(
            self.initial_capital,
            self.policy.drawdown.calculation_period_days,
            samples.iter().copied(),
            now,
        );
        state.last_snapshot = samples.last().copied();
        state.breach_active = breach_active;
        state.emergency_fired = emergency_fired;

        let snapshot = state.drawdown.snapshot();
        tracing::info!(
            "📊 Risk state restored: {} equity samples, peak {}{}",
            samples.len(),
            snapshot.peak_equity.round_dp(2),
            if emergency_only {
                ", emergency-only mode still active"
            } else {
                ""
            }
        );
        Ok(())
    }

    /// Leave emergency-only mode. Never happens automatically.
    pub async fn resume_trading(&self, reason: &str) -> Result<(), ExecutionError> {
        if !self.emergency_only.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.store
            .record(
                PORTFOLIO_AGGREGATE_ID,
                EventPayload::TradingResumed {
                    reason: reason.to_string(),
                },
            )
            .await?;
        tracing::info!("▶️  Trading resumed: {}", reason);
        Ok(())
    }

    /// Portfolio equity: initial capital plus realized and unrealized P&L.
    pub async fn equity(&self, prices: &PriceBook) -> Decimal {
        let unrealized: Decimal = self
            .store
            .open_positions()
            .await
            .iter()
            .filter_map(|p| price_for(prices, p).map(|price| p.unrealized_pnl(price)))
            .sum();
        self.initial_capital + self.store.realized_pnl().await + unrealized
    }

    /// Check a candidate against the rules in order, stopping at the first failure.
    ///
    /// Exits skip the trade-count and exposure rules and are allowed in emergency-only mode.
    pub async fn pre_trade(&self, candidate: &TradeCandidate) -> Result<PreTradeDecision, ExecutionError> {
        if candidate.is_exit {
            return Ok(PreTradeDecision::Approved(None));
        }

        let _serialized = self.pre_trade_lock.lock().await;
        let positions = self.store.open_positions().await;
        let reserved: Vec<Reserved> = self
            .reservations
            .lock()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();

        let asset = candidate.key.base_asset();
        let open_trades = positions.len() + reserved.len();
        if open_trades >= self.policy.max_concurrent_trades {
            return self
                .reject(
                    candidate,
                    RiskRule::MaxConcurrentTrades,
                    format!(
                        "{} open or pending trades, limit {}",
                        open_trades, self.policy.max_concurrent_trades
                    ),
                )
                .await;
        }

        let asset_trades = positions.iter().filter(|p| base_asset(&p.pair) == asset).count()
            + reserved.iter().filter(|r| r.key.base_asset() == asset).count();
        if asset_trades >= self.policy.max_per_asset_trades {
            return self
                .reject(
                    candidate,
                    RiskRule::MaxPerAssetTrades,
                    format!(
                        "{} open or pending trades in {}, limit {}",
                        asset_trades, asset, self.policy.max_per_asset_trades
                    ),
                )
                .await;
        }

        let exposure = &self.policy.exposure;
        let per_asset = positions
            .iter()
            .filter(|p| base_asset(&p.pair) == asset)
            .map(Position::notional)
            .chain(reserved.iter().filter(|r| r.key.base_asset() == asset).map(|r| r.notional))
            .sum::<Decimal>();
        let per_exchange = positions
            .iter()
            .filter(|p| p.venue == candidate.key.venue)
            .map(Position::notional)
            .chain(reserved.iter().filter(|r| r.key.venue == candidate.key.venue).map(|r| r.notional))
            .sum::<Decimal>();
        let total = positions
            .iter()
            .map(Position::notional)
            .chain(reserved.iter().map(|r| r.notional))
            .sum::<Decimal>();

        let checks = [
            (RiskRule::MaxPerAsset, exposure.max_per_asset, per_asset),
            (RiskRule::MaxPerExchange, exposure.max_per_exchange, per_exchange),
            (RiskRule::MaxTotalExposure, exposure.max_total, total),
        ];
        for (rule, limit, current) in checks {
            if current + candidate.notional > limit {
                self.store
                    .record(
                        candidate.signal_id,
                        EventPayload::ExposureLimitBreached {
                            key: candidate.key.clone(),
                            scope: rule.as_str().to_string(),
                            limit,
                            current,
                            proposed: candidate.notional,
                        },
                    )
                    .await?;
                tracing::info!(
                    "🛡️  {} rejected: {} exposure {} + {} exceeds {} {}",
                    candidate.key,
                    rule,
                    current.round_dp(2),
                    candidate.notional.round_dp(2),
                    limit,
                    exposure.base_currency
                );
                return Ok(PreTradeDecision::Rejected {
                    rule,
                    reason: format!("{} exposure would reach {}", rule, (current + candidate.notional).round_dp(2)),
                });
            }
        }

        if self.is_emergency_only() {
            return self
                .reject(
                    candidate,
                    RiskRule::EmergencyOnly,
                    "emergency-only mode: new entries are paused".to_string(),
                )
                .await;
        }

        let id = Uuid::new_v4();
        if let Ok(mut table) = self.reservations.lock() {
            table.insert(
                id,
                Reserved {
                    key: candidate.key.clone(),
                    notional: candidate.notional,
                },
            );
        }
        Ok(PreTradeDecision::Approved(Some(ExposureReservation {
            id,
            table: self.reservations.clone(),
        })))
    }

    async fn reject(
        &self,
        candidate: &TradeCandidate,
        rule: RiskRule,
        reason: String,
    ) -> Result<PreTradeDecision, ExecutionError> {
        self.store
            .record(
                candidate.signal_id,
                EventPayload::SignalRejected {
                    key: candidate.key.clone(),
                    action: candidate.action,
                    rule: rule.as_str().to_string(),
                    reason: reason.clone(),
                },
            )
            .await?;
        tracing::info!("🛡️  {} rejected by {}: {}", candidate.key, rule, reason);
        Ok(PreTradeDecision::Rejected { rule, reason })
    }

    /// Evaluate every open position once.
    ///
    /// Positions with a pending exit are skipped, so an immediate re-run over unchanged
    /// positions yields no new directives.
    pub async fn sweep(&self, prices: &PriceBook) -> Result<SweepReport, ExecutionError> {
        let mut state = self.sweep_state.lock().await;
        let mut report = SweepReport::default();

        report.released = self.release_stale_exits().await?;

        let equity = self.equity(prices).await;
        let snapshot = state.drawdown.update(equity, Utc::now());
        report.equity = snapshot.equity;
        report.drawdown_pct = snapshot.drawdown_pct;

        self.check_drawdown(&mut state, &snapshot).await?;
        self.record_equity(&mut state, &snapshot).await?;

        let positions = self.store.open_positions().await;
        report.evaluated = positions.len();

        let drawdown = &self.policy.drawdown;
        if drawdown.emergency_exit_enabled && snapshot.drawdown_pct >= drawdown.emergency_exit_pct {
            report.emergency = true;
            self.emergency_only.store(true, Ordering::SeqCst);
            for position in positions {
                if let Some(directive) = self
                    .emergency_exit(&mut state, position, prices, snapshot.drawdown_pct)
                    .await?
                {
                    report.directives.push(directive);
                }
            }
            return Ok(report);
        }

        for position in positions {
            if position.risk_state() != RiskState::Monitoring || position.requires_intervention {
                continue;
            }
            let Some(price) = price_for(prices, &position) else {
                tracing::debug!("No price for {} on {}, skipping", position.pair, position.venue);
                continue;
            };

            let (position, adjusted) = self.adjust_trailing(position, price).await?;
            if adjusted {
                report.trailing_adjustments += 1;
            }

            if let Some(directive) = self.evaluate_exit(&mut state, &position, price).await? {
                report.directives.push(directive);
            }
        }
        Ok(report)
    }

    async fn check_drawdown(
        &self,
        state: &mut SweepState,
        snapshot: &DrawdownSnapshot,
    ) -> Result<(), ExecutionError> {
        let config = &self.policy.drawdown;
        if snapshot.drawdown_pct < config.max_drawdown_pct {
            state.breach_active = false;
            return Ok(());
        }
        if state.breach_active {
            return Ok(());
        }
        state.breach_active = true;

        self.store
            .record(
                PORTFOLIO_AGGREGATE_ID,
                EventPayload::DrawdownBreached {
                    drawdown_pct: snapshot.drawdown_pct.round_dp(4),
                    threshold_pct: config.max_drawdown_pct,
                    equity: snapshot.equity,
                    peak_equity: snapshot.peak_equity,
                },
            )
            .await?;
        if config.pause_on_breach {
            self.emergency_only.store(true, Ordering::SeqCst);
        }
        tracing::warn!(
            "⚠️  Drawdown {}% breached max {}% (equity {}, peak {}){}",
            snapshot.drawdown_pct.round_dp(2),
            config.max_drawdown_pct,
            snapshot.equity.round_dp(2),
            snapshot.peak_equity.round_dp(2),
            if config.pause_on_breach {
                " - new entries paused"
            } else {
                ""
            }
        );
        Ok(())
    }

    async fn record_equity(
        &self,
        state: &mut SweepState,
        snapshot: &DrawdownSnapshot,
    ) -> Result<(), ExecutionError> {
        let now = Utc::now();
        let fresh = state.last_snapshot.is_some_and(|(at, equity)| {
            equity == snapshot.equity && now - at < chrono::Duration::seconds(EQUITY_SNAPSHOT_MAX_AGE_SECS)
        });
        if fresh {
            return Ok(());
        }
        let event = self
            .store
            .record(
                PORTFOLIO_AGGREGATE_ID,
                EventPayload::EquitySnapshot {
                    equity: snapshot.equity,
                    peak_equity: snapshot.peak_equity,
                    drawdown_pct: snapshot.drawdown_pct.round_dp(4),
                },
            )
            .await?;
        state.last_snapshot = Some((event.occurred_at, snapshot.equity));
        Ok(())
    }

    async fn emergency_exit(
        &self,
        state: &mut SweepState,
        position: Position,
        prices: &PriceBook,
        drawdown_pct: Decimal,
    ) -> Result<Option<ExitDirective>, ExecutionError> {
        if position.risk_state() != RiskState::Monitoring || position.requires_intervention {
            return Ok(None);
        }

        let payload = if state.emergency_fired.contains(&position.id) {
            // The first emergency exit failed and was released; retry under the cooldown
            if self.cooling_down(state, position.id, ExitReason::EmergencyExit) {
                return Ok(None);
            }
            EventPayload::ExitRequested {
                reason: ExitReason::EmergencyExit,
                quantity: None,
            }
        } else {
            EventPayload::EmergencyExitTriggered {
                price: price_for(prices, &position),
                drawdown_pct: drawdown_pct.round_dp(4),
            }
        };

        let updated = self.store.commit_position(position.id, payload).await?;
        state.emergency_fired.insert(position.id);
        self.start_cooldown(state, &updated, ExitReason::EmergencyExit, self.policy.stop_loss.cooldown_secs);

        tracing::error!(
            "🚨 Emergency exit for {} on {} (drawdown {}%)",
            updated.pair,
            updated.venue,
            drawdown_pct.round_dp(2)
        );
        Ok(Some(directive(&updated, ExitReason::EmergencyExit, None)))
    }

    async fn adjust_trailing(&self, position: Position, price: Decimal) -> Result<(Position, bool), ExecutionError> {
        let config = &self.policy.trailing_stop;
        if !config.enabled {
            return Ok((position, false));
        }
        let Some((best, stop)) = position.trailing_update(price, config.trailing_pct, config.activation_pct)
        else {
            return Ok((position, false));
        };

        let updated = self
            .store
            .commit_position(
                position.id,
                EventPayload::TrailingStopAdjusted {
                    best_price: best,
                    stop_price: stop,
                    distance_pct: config.trailing_pct,
                },
            )
            .await?;
        tracing::debug!(
            "Trailing stop for {} moved to {} (best {})",
            updated.pair,
            stop,
            best
        );
        Ok((updated, true))
    }

    /// At most one exit per position per sweep: stop loss, then trailing stop, then take profit.
    async fn evaluate_exit(
        &self,
        state: &mut SweepState,
        position: &Position,
        price: Decimal,
    ) -> Result<Option<ExitDirective>, ExecutionError> {
        let pnl_pct = position.pnl_pct(price);
        let policy = &self.policy;

        let (reason, quantity, payload, cooldown_secs) = if policy.stop_loss.enabled
            && -pnl_pct >= policy.stop_loss.percentage
        {
            (
                ExitReason::StopLoss,
                None,
                EventPayload::StopLossTriggered {
                    price,
                    loss_pct: (-pnl_pct).round_dp(4),
                    threshold_pct: policy.stop_loss.percentage,
                },
                policy.stop_loss.cooldown_secs,
            )
        } else if policy.trailing_stop.enabled && position.trailing_stop_hit(price) {
            let stop_price = position.trailing_stop_price.unwrap_or(price);
            (
                ExitReason::TrailingStop,
                None,
                EventPayload::TrailingStopTriggered { price, stop_price },
                policy.stop_loss.cooldown_secs,
            )
        } else if policy.take_profit.enabled && pnl_pct >= policy.take_profit.percentage {
            let quantity = match policy.take_profit.partial_close_pct {
                Some(pct) if pct < Decimal::ONE_HUNDRED && !position.partial_take_profit_done => {
                    Some((position.quantity * pct / Decimal::ONE_HUNDRED).round_dp(8))
                        .filter(|q| *q > Decimal::ZERO && *q < position.quantity)
                }
                _ => None,
            };
            (
                ExitReason::TakeProfit,
                quantity,
                EventPayload::TakeProfitTriggered {
                    price,
                    gain_pct: pnl_pct.round_dp(4),
                    threshold_pct: policy.take_profit.percentage,
                    close_quantity: quantity,
                },
                policy.take_profit.cooldown_secs,
            )
        } else {
            return Ok(None);
        };

        if self.cooling_down(state, position.id, reason) {
            tracing::debug!("{} for {} is cooling down", reason, position.pair);
            return Ok(None);
        }

        let updated = self.store.commit_position(position.id, payload).await?;
        self.start_cooldown(state, &updated, reason, cooldown_secs);

        tracing::warn!(
            "🛑 {} triggered for {} on {} @ {} ({}%)",
            reason,
            updated.pair,
            updated.venue,
            price,
            pnl_pct.round_dp(2)
        );
        Ok(Some(directive(&updated, reason, quantity)))
    }

    fn cooling_down(&self, state: &SweepState, position_id: Uuid, reason: ExitReason) -> bool {
        state
            .cooldowns
            .get(&(position_id, reason))
            .is_some_and(|until| Instant::now() < *until)
    }

    fn start_cooldown(&self, state: &mut SweepState, position: &Position, reason: ExitReason, base_secs: u64) {
        let cooldown = self.policy.cooldown(base_secs, position.exit_failures);
        state
            .cooldowns
            .insert((position.id, reason), Instant::now() + cooldown);
    }

    /// Pending exits that never produced an order within the order timeout go back to
    /// monitoring so the next sweep re-submits them.
    async fn release_stale_exits(&self) -> Result<usize, ExecutionError> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.order_timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        let mut released = 0;

        for position in self.store.open_positions().await {
            let Some(pending) = &position.pending_exit else {
                continue;
            };
            if pending.order_id.is_some()
                || now - pending.requested_at < timeout
                || self.in_flight.contains(&position.key())
            {
                continue;
            }

            tracing::warn!(
                "⚠️  Exit for {} on {} produced no order within {:?}, releasing",
                position.pair,
                position.venue,
                self.order_timeout
            );
            self.store
                .release_exit(
                    position.id,
                    None,
                    "no exit order within order timeout".to_string(),
                    true,
                    self.max_exit_rounds,
                )
                .await?;
            released += 1;
        }
        Ok(released)
    }
}

fn price_for(prices: &PriceBook, position: &Position) -> Option<Decimal> {
    prices
        .get(&(position.venue.clone(), position.pair.clone()))
        .copied()
}

fn directive(position: &Position, reason: ExitReason, quantity: Option<Decimal>) -> ExitDirective {
    ExitDirective {
        position_id: position.id,
        key: position.key(),
        reason,
        quantity,
    }
}
