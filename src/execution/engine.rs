use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout_at, Instant};
use uuid::Uuid;

use super::{ExecutionConfig, InFlightGuard, InFlightTable, PositionStore};
use crate::error::{ExchangeError, ExecutionError};
use crate::events::EventPayload;
use crate::exchange::{ExchangeRegistry, OrderAck, OrderRequest, VenueClient};
use crate::models::position::pnl_for;
use crate::models::{
    ExitReason, Order, OrderIntent, OrderSide, OrderStatus, OrderType, Position, PositionSide,
    PositionStatus, SignalAction, TradingKey,
};
use crate::risk::RiskPolicy;

/// Open a position for `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryOrder {
    pub key: TradingKey,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    /// Signal that produced the entry, for rejection audit
    pub signal_id: Option<Uuid>,
}

impl EntryOrder {
    pub fn market(key: TradingKey, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            key,
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
            signal_id: None,
        }
    }

    pub fn limit(key: TradingKey, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(key, side, quantity)
        }
    }

    pub fn with_signal(mut self, signal_id: Uuid) -> Self {
        self.signal_id = Some(signal_id);
        self
    }
}

/// Close all or part of an open position with a market order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitOrder {
    pub position_id: Uuid,
    pub reason: ExitReason,
    /// `None` closes the remaining quantity
    pub quantity: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderDirective {
    Entry(EntryOrder),
    Exit(ExitOrder),
}

/// A resolved order and the position it opened, reduced or closed.
#[derive(Debug, Clone)]
pub struct OrderOutcome {
    pub order: Order,
    pub position: Option<Position>,
}

struct Tracked {
    order: Order,
    failure: Option<ExecutionError>,
}

struct PendingSubmission<'a> {
    engine: &'a ExecutionEngine,
}

impl Drop for PendingSubmission<'_> {
    fn drop(&mut self) {
        if self.engine.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.engine.idle.notify_waiters();
        }
    }
}

/// Places, tracks and settles orders.
///
/// At most one order is in flight per trading key. Submissions for a busy key are refused
/// immediately rather than queued.
pub struct ExecutionEngine {
    exchanges: Arc<ExchangeRegistry>,
    store: Arc<PositionStore>,
    policy: Arc<RiskPolicy>,
    in_flight: InFlightTable,
    config: ExecutionConfig,
    draining: AtomicBool,
    pending: AtomicUsize,
    idle: Notify,
}

impl ExecutionEngine {
    pub fn new(
        exchanges: Arc<ExchangeRegistry>,
        store: Arc<PositionStore>,
        policy: Arc<RiskPolicy>,
        in_flight: InFlightTable,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            exchanges,
            store,
            policy,
            in_flight,
            config,
            draining: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<PositionStore> {
        &self.store
    }

    pub fn exchanges(&self) -> &Arc<ExchangeRegistry> {
        &self.exchanges
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn is_in_flight(&self, key: &TradingKey) -> bool {
        self.in_flight.contains(key)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Submit one order and wait until it is resolved.
    ///
    /// Consistency violations (busy key, duplicate position, closed position) are
    /// rejected before anything reaches the venue.
    pub async fn submit(&self, directive: OrderDirective) -> Result<OrderOutcome, ExecutionError> {
        let _pending = self.begin()?;
        match directive {
            OrderDirective::Entry(entry) => self.submit_entry(entry).await,
            OrderDirective::Exit(exit) => self.submit_exit(exit).await,
        }
    }

    fn begin(&self) -> Result<PendingSubmission<'_>, ExecutionError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingSubmission { engine: self };
        if self.is_draining() {
            return Err(ExecutionError::ShuttingDown);
        }
        Ok(guard)
    }

    async fn submit_entry(&self, entry: EntryOrder) -> Result<OrderOutcome, ExecutionError> {
        if entry.quantity <= Decimal::ZERO {
            return Err(ExecutionError::InvalidRequest(format!(
                "quantity must be positive, got {}",
                entry.quantity
            )));
        }
        if entry.order_type == OrderType::Limit
            && !entry.price.is_some_and(|price| price > Decimal::ZERO)
        {
            return Err(ExecutionError::InvalidRequest(
                "limit orders need a positive price".to_string(),
            ));
        }
        let client = self.client(&entry.key.venue)?;
        let _guard = self
            .reserve(&entry.key, entry.signal_id, action_for(entry.side))
            .await?;

        if self.store.open_position_for(&entry.key).await.is_some() {
            tracing::warn!("⚠️  {} already has an open position, entry refused", entry.key);
            return Err(ExecutionError::PositionAlreadyOpen(entry.key));
        }
        self.check_tradable(&client, &entry.key.pair).await?;

        let order = Order::new(
            &entry.key,
            entry.side,
            entry.order_type,
            entry.quantity,
            entry.price,
            OrderIntent::Entry,
            Utc::now(),
        );
        let order = self.store.create_order(order).await?;
        tracing::info!(
            "📤 Submitting {} {} {} {} on {} (order {})",
            order.order_type.as_str(),
            order.side.as_str(),
            order.requested_quantity,
            order.pair,
            order.venue,
            order.id
        );

        let tracked = self.track(&client, order).await?;
        let position = self.settle(&tracked.order, tracked.failure.as_ref()).await?;
        match tracked.failure {
            Some(error) => Err(error),
            None => Ok(OrderOutcome {
                order: tracked.order,
                position,
            }),
        }
    }

    async fn submit_exit(&self, exit: ExitOrder) -> Result<OrderOutcome, ExecutionError> {
        let position = self
            .store
            .position(exit.position_id)
            .await?
            .ok_or(ExecutionError::PositionNotFound(exit.position_id))?;
        let client = self.client(&position.venue)?;
        let key = position.key();
        let _guard = self.reserve(&key, None, action_for(position.side.exit_side())).await?;

        // Re-read under the reservation: a concurrent exit may have closed it
        let position = self
            .store
            .position(exit.position_id)
            .await?
            .ok_or(ExecutionError::PositionNotFound(exit.position_id))?;
        if !position.is_open() {
            tracing::warn!("⚠️  Exit refused, position {} is already closed", position.id);
            return Err(ExecutionError::PositionNotOpen(position.id));
        }
        if let Some(quantity) = exit.quantity {
            if quantity <= Decimal::ZERO || quantity > position.quantity {
                return Err(ExecutionError::InvalidRequest(format!(
                    "exit quantity {} outside (0, {}]",
                    quantity, position.quantity
                )));
            }
        }

        let position = match &position.pending_exit {
            None => {
                self.store
                    .commit_position(
                        position.id,
                        EventPayload::ExitRequested {
                            reason: exit.reason,
                            quantity: exit.quantity,
                        },
                    )
                    .await?
            }
            Some(pending) if pending.order_id.is_none() => position,
            Some(_) => {
                tracing::warn!("⚠️  Exit order already placed for position {}", position.id);
                return Err(ExecutionError::InFlight(key));
            }
        };
        let (reason, requested) = position
            .pending_exit
            .as_ref()
            .map(|p| (p.reason, p.quantity))
            .unwrap_or((exit.reason, exit.quantity));
        let quantity = requested.unwrap_or(position.quantity).min(position.quantity);

        let order = Order::new(
            &key,
            position.side.exit_side(),
            OrderType::Market,
            quantity,
            None,
            OrderIntent::Exit {
                position_id: position.id,
            },
            Utc::now(),
        );
        let order = self.store.create_order(order).await?;
        self.store
            .commit_position(position.id, EventPayload::ExitOrderPlaced { order_id: order.id })
            .await?;
        tracing::info!(
            "📤 Submitting {} exit: {} {} {} on {} (order {})",
            reason,
            order.side.as_str(),
            order.requested_quantity,
            order.pair,
            order.venue,
            order.id
        );

        let tracked = self.track(&client, order).await?;
        let position = self.settle(&tracked.order, tracked.failure.as_ref()).await?;
        match tracked.failure {
            Some(error) => Err(error),
            None => Ok(OrderOutcome {
                order: tracked.order,
                position,
            }),
        }
    }

    fn client(&self, venue: &str) -> Result<Arc<VenueClient>, ExecutionError> {
        self.exchanges
            .get(venue)
            .ok_or_else(|| ExecutionError::UnknownVenue(venue.to_string()))
    }

    async fn reserve(
        &self,
        key: &TradingKey,
        signal_id: Option<Uuid>,
        action: SignalAction,
    ) -> Result<InFlightGuard, ExecutionError> {
        if let Some(guard) = self.in_flight.try_reserve(key) {
            return Ok(guard);
        }
        tracing::warn!("⚠️  Order already in flight for {}, rejecting", key);
        if let Some(signal_id) = signal_id {
            self.store
                .record(
                    signal_id,
                    EventPayload::SignalRejected {
                        key: key.clone(),
                        action,
                        rule: "in_flight".to_string(),
                        reason: "an order is already in flight for this key".to_string(),
                    },
                )
                .await?;
        }
        Err(ExecutionError::InFlight(key.clone()))
    }

    async fn check_tradable(&self, client: &VenueClient, pair: &str) -> Result<(), ExecutionError> {
        match client.is_tradable(pair, self.config.call_timeout()).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ExecutionError::InvalidRequest(format!(
                "{} is not tradable on {}",
                pair,
                client.name()
            ))),
            Err(e) => Err(ExecutionError::InvalidRequest(format!(
                "could not confirm {} is tradable on {}: {}",
                pair,
                client.name(),
                e
            ))),
        }
    }

    /// Place the order and poll it until it reaches a terminal status or the order
    /// timeout elapses. Event commits are never cut short by the timeout; only venue
    /// calls and waits are bounded by the deadline.
    async fn track(&self, client: &Arc<VenueClient>, order: Order) -> Result<Tracked, ExecutionError> {
        let deadline = Instant::now() + self.config.order_timeout();
        let call_timeout = self.config.call_timeout();
        let request = OrderRequest {
            client_order_id: order.id,
            pair: order.pair.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.requested_quantity,
            price: order.price,
        };
        let label = format!("create_order {}", order.key());

        let venue = client.as_ref();
        let req = &request;
        let placed = timeout_at(
            deadline,
            self.config
                .retry
                .run(&label, move |_| venue.create_order(req, call_timeout)),
        )
        .await;

        let ack = match placed {
            Ok(Ok((ack, attempts))) => {
                if attempts > 1 {
                    tracing::info!("Order {} placed after {} attempts", order.id, attempts);
                }
                ack
            }
            Ok(Err(exhausted)) => {
                // The request may have reached the venue even though every response was lost
                let found = if exhausted.error.is_transient() {
                    self.find_by_client_id(client, &order).await
                } else {
                    None
                };
                match found {
                    Some(ack) => ack,
                    None => return self.fail(order, exhausted.error, exhausted.attempts).await,
                }
            }
            Err(_) => return self.expire(client, order).await,
        };

        let order = self
            .store
            .commit_order(
                order.id,
                EventPayload::OrderAcknowledged {
                    venue_order_id: ack.venue_order_id.clone(),
                    status: OrderStatus::Open,
                },
            )
            .await?;
        let mut order = self.apply_ack(order, &ack).await?;
        tracing::info!(
            "✅ Order {} acknowledged by {} as {} ({})",
            order.id,
            order.venue,
            ack.venue_order_id,
            ack.status
        );

        while !order.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                return self.expire(client, order).await;
            }
            sleep_until((now + self.config.poll_interval()).min(deadline)).await;

            let limit = call_timeout.min(deadline.saturating_duration_since(Instant::now()));
            if limit.is_zero() {
                continue;
            }
            match client
                .fetch_order_status(&ack.venue_order_id, &order.pair, limit)
                .await
            {
                Ok(status) => order = self.apply_ack(order, &status).await?,
                Err(e) => tracing::warn!("⚠️  Status check for order {} failed: {}", order.id, e),
            }
        }

        let failure = (order.status == OrderStatus::Failed).then(|| ExecutionError::OrderFailed {
            order_id: order.id,
            attempts: 1,
            source: ExchangeError::Venue("order failed at venue".to_string()),
        });
        Ok(Tracked { order, failure })
    }

    /// Bring the order in line with what the venue reported.
    async fn apply_ack(&self, mut order: Order, ack: &OrderAck) -> Result<Order, ExecutionError> {
        let filled = ack.filled_quantity.min(order.requested_quantity);
        if ack.status == OrderStatus::Filled && filled == order.requested_quantity {
            let order = self
                .store
                .commit_order(
                    order.id,
                    EventPayload::OrderFilled {
                        filled_quantity: filled,
                        average_fill_price: ack.average_price,
                        fee: ack.fee,
                        fee_currency: ack.fee_currency.clone(),
                    },
                )
                .await?;
            tracing::info!(
                "💰 Order {} filled: {} {} @ {}",
                order.id,
                order.filled_quantity,
                order.pair,
                order
                    .average_fill_price
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "?".to_string())
            );
            return Ok(order);
        }

        if filled > order.filled_quantity {
            order = self
                .store
                .commit_order(
                    order.id,
                    EventPayload::OrderPartiallyFilled {
                        filled_quantity: filled,
                        average_fill_price: ack.average_price,
                        fee: ack.fee,
                        fee_currency: ack.fee_currency.clone(),
                    },
                )
                .await?;
            tracing::info!(
                "Order {} partially filled: {}/{}",
                order.id,
                order.filled_quantity,
                order.requested_quantity
            );
        }

        match ack.status {
            OrderStatus::Filled => {
                // Only a complete fill may be recorded as Filled; close out at what executed
                tracing::warn!(
                    "⚠️  {} reported order {} filled but only {}/{} executed",
                    order.venue,
                    order.id,
                    order.filled_quantity,
                    order.requested_quantity
                );
                self.store
                    .commit_order(
                        order.id,
                        EventPayload::OrderCancelled {
                            filled_quantity: order.filled_quantity,
                            reason: format!(
                                "venue closed short: {} of {} filled",
                                order.filled_quantity, order.requested_quantity
                            ),
                        },
                    )
                    .await
            }
            OrderStatus::Cancelled => {
                self.store
                    .commit_order(
                        order.id,
                        EventPayload::OrderCancelled {
                            filled_quantity: order.filled_quantity,
                            reason: format!("{} by venue", ack.status),
                        },
                    )
                    .await
            }
            OrderStatus::Failed => {
                self.store
                    .commit_order(
                        order.id,
                        EventPayload::OrderFailed {
                            error_code: "venue_rejected".to_string(),
                            reason: "order failed at venue".to_string(),
                            attempts: 1,
                        },
                    )
                    .await
            }
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled => Ok(order),
        }
    }

    async fn fail(&self, order: Order, error: ExchangeError, attempts: u32) -> Result<Tracked, ExecutionError> {
        tracing::error!(
            "❌ Order {} for {} failed after {} attempt(s): {}",
            order.id,
            order.key(),
            attempts,
            error
        );
        let order = self
            .store
            .commit_order(
                order.id,
                EventPayload::OrderFailed {
                    error_code: error.code().to_string(),
                    reason: error.to_string(),
                    attempts,
                },
            )
            .await?;
        Ok(Tracked {
            failure: Some(ExecutionError::OrderFailed {
                order_id: order.id,
                attempts,
                source: error,
            }),
            order,
        })
    }

    async fn expire(&self, client: &Arc<VenueClient>, order: Order) -> Result<Tracked, ExecutionError> {
        let timeout = self.config.order_timeout();
        tracing::warn!(
            "⏱️  Order {} for {} unresolved after {:?}, cancelling",
            order.id,
            order.key(),
            timeout
        );
        let order = self.cancel_and_reconcile(client, order, "order timeout").await?;
        let failure = (order.status != OrderStatus::Filled).then(|| ExecutionError::Timeout {
            order_id: order.id,
            timeout,
        });
        Ok(Tracked { order, failure })
    }

    /// Cancel at the venue and record whatever state the venue reports. An order the
    /// venue cannot account for is marked unreconciled and failed.
    async fn cancel_and_reconcile(
        &self,
        client: &Arc<VenueClient>,
        mut order: Order,
        reason: &str,
    ) -> Result<Order, ExecutionError> {
        let call_timeout = self.config.call_timeout();
        let venue_order_id = match &order.venue_order_id {
            Some(id) => Some(id.clone()),
            None => self
                .find_by_client_id(client, &order)
                .await
                .map(|ack| ack.venue_order_id),
        };

        if let Some(venue_order_id) = venue_order_id {
            let resolved = match client.cancel_order(&venue_order_id, &order.pair, call_timeout).await {
                Ok(ack) => Some(ack),
                Err(e) => {
                    tracing::warn!("⚠️  Cancel of order {} failed: {}", order.id, e);
                    client
                        .fetch_order_status(&venue_order_id, &order.pair, call_timeout)
                        .await
                        .ok()
                }
            };
            if let Some(ack) = resolved {
                if order.venue_order_id.is_none() {
                    order = self
                        .store
                        .commit_order(
                            order.id,
                            EventPayload::OrderAcknowledged {
                                venue_order_id: ack.venue_order_id.clone(),
                                status: OrderStatus::Open,
                            },
                        )
                        .await?;
                }
                order = self.apply_ack(order, &ack).await?;
            }
        }

        if !order.is_terminal() {
            tracing::error!(
                "❌ Order {} could not be reconciled with {}: {}",
                order.id,
                order.venue,
                reason
            );
            order = self
                .store
                .commit_order(
                    order.id,
                    EventPayload::OrderUnreconciled {
                        status: order.status,
                        reason: reason.to_string(),
                    },
                )
                .await?;
            order = self
                .store
                .commit_order(
                    order.id,
                    EventPayload::OrderFailed {
                        error_code: "unreconciled".to_string(),
                        reason: reason.to_string(),
                        attempts: 1,
                    },
                )
                .await?;
        }
        Ok(order)
    }

    async fn find_by_client_id(&self, client: &VenueClient, order: &Order) -> Option<OrderAck> {
        match client
            .fetch_open_orders(Some(&order.pair), self.config.call_timeout())
            .await
        {
            Ok(open) => open
                .into_iter()
                .find(|ack| ack.client_order_id == Some(order.id)),
            Err(e) => {
                tracing::warn!("⚠️  Could not list open orders on {}: {}", client.name(), e);
                None
            }
        }
    }

    /// Apply a terminal order's fills to the position book.
    async fn settle(
        &self,
        order: &Order,
        failure: Option<&ExecutionError>,
    ) -> Result<Option<Position>, ExecutionError> {
        match order.intent {
            OrderIntent::Entry => self.settle_entry(order).await,
            OrderIntent::Exit { position_id } => self.settle_exit(position_id, order, failure).await,
        }
    }

    async fn settle_entry(&self, order: &Order) -> Result<Option<Position>, ExecutionError> {
        if order.filled_quantity.is_zero() {
            return Ok(None);
        }
        let Some(entry_price) = order.average_fill_price.or(order.price) else {
            tracing::error!("❌ Order {} filled without a price, position not opened", order.id);
            return Ok(None);
        };
        let position = self.position_from_fill(order, entry_price);
        Ok(Some(self.store.create_position(position).await?))
    }

    fn position_from_fill(&self, order: &Order, entry_price: Decimal) -> Position {
        let side = PositionSide::from_entry_side(order.side);
        let offset = |pct: Decimal| entry_price * pct / Decimal::ONE_HUNDRED;
        let (stop_loss_price, take_profit_price) = match side {
            PositionSide::Long => (
                entry_price - offset(self.policy.stop_loss_pct()),
                entry_price + offset(self.policy.take_profit_pct()),
            ),
            PositionSide::Short => (
                entry_price + offset(self.policy.stop_loss_pct()),
                entry_price - offset(self.policy.take_profit_pct()),
            ),
        };
        let now = Utc::now();

        Position {
            id: Uuid::new_v4(),
            pair: order.pair.clone(),
            venue: order.venue.clone(),
            strategy_id: order.strategy_id.clone(),
            side,
            quantity: order.filled_quantity,
            initial_quantity: order.filled_quantity,
            entry_price,
            entry_order_id: order.id,
            exit_price: None,
            stop_loss_price: self.policy.stop_loss.enabled.then_some(stop_loss_price),
            take_profit_price: self.policy.take_profit.enabled.then_some(take_profit_price),
            trailing_stop_distance: None,
            trailing_stop_price: None,
            best_price: entry_price,
            status: PositionStatus::Open,
            pending_exit: None,
            exit_reason: None,
            partial_take_profit_done: false,
            exit_failures: 0,
            requires_intervention: false,
            opened_at: now,
            updated_at: now,
            closed_at: None,
            realized_pnl: Decimal::ZERO,
            realized_pnl_pct: Decimal::ZERO,
        }
    }

    async fn settle_exit(
        &self,
        position_id: Uuid,
        order: &Order,
        failure: Option<&ExecutionError>,
    ) -> Result<Option<Position>, ExecutionError> {
        let Some(position) = self.store.position(position_id).await? else {
            return Ok(None);
        };
        if !position.is_open() {
            return Ok(Some(position));
        }

        let filled = order.filled_quantity.min(position.quantity);
        if filled.is_zero() {
            let reason = match failure {
                Some(error) => error.to_string(),
                None => format!("exit order {} {}", order.id, order.status),
            };
            let position = self
                .store
                .release_exit(
                    position_id,
                    Some(order.id),
                    reason,
                    true,
                    self.config.max_exit_retry_rounds,
                )
                .await?;
            return Ok(Some(position));
        }

        let exit_price = match order.average_fill_price.or(order.price) {
            Some(price) => price,
            None => {
                tracing::warn!(
                    "⚠️  Exit order {} filled without a price, using entry price",
                    order.id
                );
                position.entry_price
            }
        };
        let realized = pnl_for(position.side, position.entry_price, exit_price, filled);

        let payload = if filled >= position.quantity {
            let total = position.realized_pnl + realized;
            let basis = position.entry_price * position.initial_quantity;
            let pct = if basis.is_zero() {
                Decimal::ZERO
            } else {
                total / basis * Decimal::ONE_HUNDRED
            };
            EventPayload::PositionClosed {
                order_id: Some(order.id),
                quantity: filled,
                exit_price,
                realized_pnl: total,
                realized_pnl_pct: pct.round_dp(4),
            }
        } else {
            EventPayload::PositionReduced {
                order_id: order.id,
                quantity: filled,
                exit_price,
                realized_pnl: realized,
                remaining: position.quantity - filled,
            }
        };

        let updated = self.store.commit_position(position_id, payload).await?;
        if updated.is_open() {
            tracing::info!(
                "✂️  Reduced {} on {} by {} @ {} (P&L: {}, {} left)",
                updated.pair,
                updated.venue,
                filled,
                exit_price,
                realized.round_dp(2),
                updated.quantity
            );
        } else {
            tracing::info!(
                "📉 Closed {} on {} @ {} (P&L: {} / {}%, reason: {})",
                updated.pair,
                updated.venue,
                exit_price,
                updated.realized_pnl.round_dp(2),
                updated.realized_pnl_pct.round_dp(2),
                updated
                    .exit_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(Some(updated))
    }

    /// Resolve orders left open by a previous run: refresh their status, cancel whatever
    /// is still working and settle the fills.
    pub async fn reconcile_open_orders(&self) -> Result<usize, ExecutionError> {
        let orders = self.store.open_orders().await;
        if orders.is_empty() {
            return Ok(0);
        }
        tracing::info!("🔄 Reconciling {} open orders from a previous run", orders.len());

        let mut reconciled = 0;
        for order in orders {
            let Some(client) = self.exchanges.get(&order.venue) else {
                tracing::warn!("⚠️  Order {} is on unknown venue '{}'", order.id, order.venue);
                continue;
            };
            let Some(_guard) = self.in_flight.try_reserve(&order.key()) else {
                continue;
            };

            let order = match order.venue_order_id.clone() {
                Some(venue_order_id) => match client
                    .fetch_order_status(&venue_order_id, &order.pair, self.config.call_timeout())
                    .await
                {
                    Ok(ack) => self.apply_ack(order, &ack).await?,
                    Err(e) => {
                        tracing::warn!("⚠️  Status check for order {} failed: {}", order.id, e);
                        order
                    }
                },
                None => order,
            };
            let order = if order.is_terminal() {
                order
            } else {
                self.cancel_and_reconcile(&client, order, "open at startup").await?
            };
            self.settle(&order, None).await?;
            reconciled += 1;
        }
        Ok(reconciled)
    }

    /// Cancel every open order on `venue`: tracked ones no submission is working on, then
    /// anything else the venue still reports.
    pub async fn cancel_all(&self, venue: &str) -> Result<usize, ExecutionError> {
        let client = self.client(venue)?;
        let mut cancelled = 0;
        for order in self.store.open_orders().await {
            if order.venue != venue {
                continue;
            }
            let Some(_guard) = self.in_flight.try_reserve(&order.key()) else {
                continue;
            };
            let order = self.cancel_and_reconcile(&client, order, "cancelled by operator").await?;
            self.settle(&order, None).await?;
            cancelled += 1;
        }

        // Orders the venue still reports that this process never tracked
        let call_timeout = self.config.call_timeout();
        let tracked: HashSet<Uuid> = self.store.open_orders().await.iter().map(|o| o.id).collect();
        match client.fetch_open_orders(None, call_timeout).await {
            Ok(open) => {
                for ack in open {
                    if ack.client_order_id.is_some_and(|id| tracked.contains(&id)) {
                        continue;
                    }
                    match client
                        .cancel_order(&ack.venue_order_id, &ack.pair, call_timeout)
                        .await
                    {
                        Ok(_) => cancelled += 1,
                        Err(e) => tracing::warn!(
                            "⚠️  Could not cancel {} order {}: {}",
                            venue,
                            ack.venue_order_id,
                            e
                        ),
                    }
                }
            }
            Err(e) => tracing::warn!("⚠️  Could not list open orders on {}: {}", venue, e),
        }

        if cancelled > 0 {
            tracing::info!("🧹 Cancelled {} open orders on {}", cancelled, venue);
        }
        Ok(cancelled)
    }

    /// Stop accepting submissions, wait up to `limit` for running ones, then mark every
    /// order still open as unreconciled. Returns how many were left open.
    pub async fn drain(&self, limit: Duration) -> Result<usize, ExecutionError> {
        self.draining.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + limit;

        loop {
            let notified = self.idle.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            if timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(
                    "⏱️  {} submissions still running after {:?}",
                    self.pending.load(Ordering::SeqCst),
                    limit
                );
                break;
            }
        }

        let mut unreconciled = 0;
        for order in self.store.open_orders().await {
            tracing::warn!(
                "⚠️  Order {} ({}) is still {} at shutdown",
                order.id,
                order.key(),
                order.status
            );
            self.store
                .commit_order(
                    order.id,
                    EventPayload::OrderUnreconciled {
                        status: order.status,
                        reason: "unresolved at shutdown".to_string(),
                    },
                )
                .await?;
            unreconciled += 1;
        }
        Ok(unreconciled)
    }
}

fn action_for(side: OrderSide) -> SignalAction {
    match side {
        OrderSide::Buy => SignalAction::Buy,
        OrderSide::Sell => SignalAction::Sell,
    }
}
