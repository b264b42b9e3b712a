use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::events::{Aggregate, DomainEvent, EventLog, EventPayload};
use crate::models::{Order, Position, TradingKey};
use crate::persistence::{OrderRepository, PositionRepository};

/// Live orders and positions, mutated only through events.
///
/// Every change is built as an event, applied to a copy, appended to the event log and only
/// then written to the repository and the in-memory view. One mutex serializes commits, so
/// events of one aggregate are appended in causal order.
pub struct PositionStore {
    positions: Arc<dyn PositionRepository>,
    orders: Arc<dyn OrderRepository>,
    log: EventLog,
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    open_positions: HashMap<Uuid, Position>,
    open_orders: HashMap<Uuid, Order>,
    realized_pnl: Decimal,
}

impl PositionStore {
    pub fn new(
        positions: Arc<dyn PositionRepository>,
        orders: Arc<dyn OrderRepository>,
        log: EventLog,
    ) -> Self {
        Self {
            positions,
            orders,
            log,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Restore open positions, open orders and realized P&L from the repositories.
    pub async fn load(&self) -> Result<(), ExecutionError> {
        let all = self.positions.list_all().await?;
        let orders = self.orders.list_open().await?;

        let mut state = self.state.lock().await;
        state.realized_pnl = all.iter().map(|p| p.realized_pnl).sum();
        state.open_positions = all
            .into_iter()
            .filter(|p| p.is_open())
            .map(|p| (p.id, p))
            .collect();
        state.open_orders = orders.into_iter().map(|o| (o.id, o)).collect();

        tracing::info!(
            "Restored {} open positions and {} open orders (realized P&L: {})",
            state.open_positions.len(),
            state.open_orders.len(),
            state.realized_pnl.round_dp(2)
        );
        Ok(())
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub async fn open_positions(&self) -> Vec<Position> {
        let state = self.state.lock().await;
        let mut positions: Vec<Position> = state.open_positions.values().cloned().collect();
        positions.sort_by_key(|p| p.opened_at);
        positions
    }

    pub async fn open_position_for(&self, key: &TradingKey) -> Option<Position> {
        let state = self.state.lock().await;
        state
            .open_positions
            .values()
            .find(|p| p.strategy_id == key.strategy_id && p.pair == key.pair && p.venue == key.venue)
            .cloned()
    }

    /// Open or closed position by id
    pub async fn position(&self, id: Uuid) -> Result<Option<Position>, ExecutionError> {
        if let Some(position) = self.state.lock().await.open_positions.get(&id) {
            return Ok(Some(position.clone()));
        }
        Ok(self.positions.get(id).await?)
    }

    pub async fn open_orders(&self) -> Vec<Order> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state.open_orders.values().cloned().collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    pub async fn order(&self, id: Uuid) -> Result<Option<Order>, ExecutionError> {
        if let Some(order) = self.state.lock().await.open_orders.get(&id) {
            return Ok(Some(order.clone()));
        }
        Ok(self.orders.get(id).await?)
    }

    /// Realized P&L over all positions, open and closed
    pub async fn realized_pnl(&self) -> Decimal {
        self.state.lock().await.realized_pnl
    }

    pub async fn create_position(&self, position: Position) -> Result<Position, ExecutionError> {
        let mut state = self.state.lock().await;
        let event = DomainEvent::new(position.id, EventPayload::PositionOpened { position });
        let opened = Position::create(&event)?;

        self.log.append(event).await?;
        state.open_positions.insert(opened.id, opened.clone());
        self.positions.create(&opened).await?;

        tracing::info!(
            "📈 Opened {} position {} on {} @ {} (qty {})",
            opened.side.as_str(),
            opened.pair,
            opened.venue,
            opened.entry_price,
            opened.quantity
        );
        Ok(opened)
    }

    /// Apply one event to an open position and persist it.
    pub async fn commit_position(
        &self,
        position_id: Uuid,
        payload: EventPayload,
    ) -> Result<Position, ExecutionError> {
        let mut state = self.state.lock().await;
        let current = state
            .open_positions
            .get(&position_id)
            .cloned()
            .ok_or(ExecutionError::PositionNotOpen(position_id))?;

        let event = DomainEvent::new(position_id, payload);
        let mut next = current.clone();
        next.apply(&event)?;

        self.log.append(event).await?;
        state.realized_pnl += next.realized_pnl - current.realized_pnl;
        if next.is_open() {
            state.open_positions.insert(position_id, next.clone());
        } else {
            state.open_positions.remove(&position_id);
        }
        self.positions.update(&next).await?;
        Ok(next)
    }

    /// Return a position with a pending exit to monitoring.
    ///
    /// Failed rounds count toward `max_exit_rounds`; reaching it flags the position for
    /// manual intervention and the sweep stops re-submitting it.
    pub async fn release_exit(
        &self,
        position_id: Uuid,
        order_id: Option<Uuid>,
        reason: String,
        failed: bool,
        max_exit_rounds: u32,
    ) -> Result<Position, ExecutionError> {
        let position = self
            .commit_position(
                position_id,
                EventPayload::ExitOrderReleased {
                    order_id,
                    reason: reason.clone(),
                    failed,
                },
            )
            .await?;

        if failed && position.exit_failures >= max_exit_rounds && !position.requires_intervention {
            tracing::error!(
                "🚨 Position {} ({} on {}) needs manual intervention after {} failed exit rounds: {}",
                position.id,
                position.pair,
                position.venue,
                position.exit_failures,
                reason
            );
            return self
                .commit_position(
                    position_id,
                    EventPayload::ManualInterventionRequired {
                        exit_failures: position.exit_failures,
                        last_error: reason,
                    },
                )
                .await;
        }
        Ok(position)
    }

    pub async fn create_order(&self, order: Order) -> Result<Order, ExecutionError> {
        let mut state = self.state.lock().await;
        let event = DomainEvent::new(order.id, EventPayload::OrderSubmitted { order });
        let submitted = Order::create(&event)?;

        self.log.append(event).await?;
        state.open_orders.insert(submitted.id, submitted.clone());
        self.orders.create(&submitted).await?;
        Ok(submitted)
    }

    /// Apply one event to a live order and persist it. Terminal orders leave the live view.
    pub async fn commit_order(&self, order_id: Uuid, payload: EventPayload) -> Result<Order, ExecutionError> {
        let mut state = self.state.lock().await;
        let current = match state.open_orders.get(&order_id) {
            Some(order) => order.clone(),
            None => self
                .orders
                .get(order_id)
                .await?
                .ok_or_else(|| ExecutionError::InvalidRequest(format!("order {} not found", order_id)))?,
        };

        let event = DomainEvent::new(order_id, payload);
        let mut next = current;
        next.apply(&event)?;

        self.log.append(event).await?;
        if next.is_terminal() {
            state.open_orders.remove(&order_id);
        } else {
            state.open_orders.insert(order_id, next.clone());
        }
        self.orders.update(&next).await?;
        Ok(next)
    }

    /// Append an event that changes no order or position (signals, portfolio events).
    pub async fn record(&self, aggregate_id: Uuid, payload: EventPayload) -> Result<DomainEvent, ExecutionError> {
        Ok(self.log.append(DomainEvent::new(aggregate_id, payload)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLogConfig;
    use crate::models::position::tests::open_position;
    use crate::models::{ExitReason, OrderIntent, OrderSide, OrderStatus, OrderType, PositionSide, RiskState};
    use crate::persistence::{EventRepository, InMemoryStore};
    use crate::shutdown::Shutdown;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn store() -> (PositionStore, Arc<InMemoryStore>) {
        let repo = Arc::new(InMemoryStore::new());
        let log = EventLog::new(repo.clone(), EventLogConfig::default(), Shutdown::new());
        (PositionStore::new(repo.clone(), repo.clone(), log), repo)
    }

    #[tokio::test]
    async fn test_state_matches_replay() {
        let (store, repo) = store();
        let position = store
            .create_position(open_position(PositionSide::Long, dec!(100), dec!(1)))
            .await
            .unwrap();

        store
            .commit_position(
                position.id,
                EventPayload::StopLossTriggered {
                    price: dec!(97),
                    loss_pct: dec!(3),
                    threshold_pct: dec!(2),
                },
            )
            .await
            .unwrap();
        let live = store.open_positions().await.remove(0);
        assert_eq!(live.risk_state(), RiskState::ExitPending);

        let events = store.log().history(position.id).await.unwrap();
        let replayed = Position::fold(&events).unwrap().unwrap();
        assert_eq!(replayed, live);
        assert_eq!(
            PositionRepository::get(repo.as_ref(), position.id).await.unwrap(),
            Some(live)
        );
    }

    #[tokio::test]
    async fn test_rejected_event_changes_nothing() {
        let (store, repo) = store();
        let position = store
            .create_position(open_position(PositionSide::Long, dec!(100), dec!(1)))
            .await
            .unwrap();

        // No exit is pending, so there is nothing to attach an order to
        let err = store
            .commit_position(position.id, EventPayload::ExitOrderPlaced { order_id: Uuid::new_v4() })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Projection(_)));
        assert_eq!(
            repo.list_by_aggregate(position.id, 0, 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_closing_moves_position_out_of_live_view() {
        let (store, _) = store();
        let position = store
            .create_position(open_position(PositionSide::Long, dec!(100), dec!(2)))
            .await
            .unwrap();
        store
            .commit_position(
                position.id,
                EventPayload::ExitRequested {
                    reason: ExitReason::Manual,
                    quantity: None,
                },
            )
            .await
            .unwrap();
        let closed = store
            .commit_position(
                position.id,
                EventPayload::PositionClosed {
                    order_id: None,
                    quantity: dec!(2),
                    exit_price: dec!(110),
                    realized_pnl: dec!(20),
                    realized_pnl_pct: dec!(10),
                },
            )
            .await
            .unwrap();

        assert!(!closed.is_open());
        assert!(store.open_positions().await.is_empty());
        assert_eq!(store.realized_pnl().await, dec!(20));
        assert_eq!(store.position(position.id).await.unwrap(), Some(closed));
    }

    #[tokio::test]
    async fn test_repeated_failed_releases_escalate() {
        let (store, _) = store();
        let position = store
            .create_position(open_position(PositionSide::Long, dec!(100), dec!(1)))
            .await
            .unwrap();

        for round in 1..=2u32 {
            store
                .commit_position(
                    position.id,
                    EventPayload::ExitRequested {
                        reason: ExitReason::StopLoss,
                        quantity: None,
                    },
                )
                .await
                .unwrap();
            let released = store
                .release_exit(position.id, None, "venue down".into(), true, 2)
                .await
                .unwrap();
            assert_eq!(released.exit_failures, round);
            assert_eq!(released.requires_intervention, round == 2);
        }

        let escalations = store
            .log()
            .recent(crate::events::EventType::ManualInterventionRequired, 10)
            .await
            .unwrap();
        assert_eq!(escalations.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_order_leaves_open_orders() {
        let (store, _) = store();
        let order = Order::new(
            &TradingKey::new("s1", "BTC/USDT", "paper"),
            OrderSide::Buy,
            OrderType::Market,
            dec!(1),
            None,
            OrderIntent::Entry,
            Utc::now(),
        );
        let order = store.create_order(order).await.unwrap();
        assert_eq!(store.open_orders().await.len(), 1);

        let failed = store
            .commit_order(
                order.id,
                EventPayload::OrderFailed {
                    error_code: "insufficient_balance".into(),
                    reason: "no funds".into(),
                    attempts: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.status, OrderStatus::Failed);
        assert!(store.open_orders().await.is_empty());
    }
}
