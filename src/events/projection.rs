use uuid::Uuid;

use super::{DomainEvent, EventPayload};
use crate::error::ProjectionError;
use crate::models::{ExitReason, Order, OrderStatus, PendingExit, Position, PositionStatus};

/// State rebuilt by folding an aggregate's events in sequence order.
///
/// Live components mutate Orders and Positions through `apply` as well, so a replay
/// reproduces exactly what was stored.
pub trait Aggregate: Sized {
    const NAME: &'static str;

    fn id(&self) -> Uuid;

    /// Build the aggregate from its creation event.
    fn create(event: &DomainEvent) -> Result<Self, ProjectionError>;

    fn apply(&mut self, event: &DomainEvent) -> Result<(), ProjectionError>;

    fn fold<'a, I>(events: I) -> Result<Option<Self>, ProjectionError>
    where
        I: IntoIterator<Item = &'a DomainEvent>,
    {
        let mut state: Option<Self> = None;
        for event in events {
            match state.as_mut() {
                None => state = Some(Self::create(event)?),
                Some(current) => {
                    if current.id() != event.aggregate_id {
                        return Err(ProjectionError::WrongAggregate {
                            expected: current.id(),
                            actual: event.aggregate_id,
                        });
                    }
                    current.apply(event)?;
                }
            }
        }
        Ok(state)
    }
}

fn unexpected<A: Aggregate>(aggregate: &A, event: &DomainEvent) -> ProjectionError {
    ProjectionError::Unexpected {
        aggregate: A::NAME,
        id: aggregate.id(),
        event_type: event.event_type(),
    }
}

impl Aggregate for Order {
    const NAME: &'static str = "order";

    fn id(&self) -> Uuid {
        self.id
    }

    fn create(event: &DomainEvent) -> Result<Self, ProjectionError> {
        match &event.payload {
            EventPayload::OrderSubmitted { order } => Ok(order.clone()),
            _ => Err(ProjectionError::NotACreationEvent {
                aggregate: Self::NAME,
                event_type: event.event_type(),
            }),
        }
    }

    fn apply(&mut self, event: &DomainEvent) -> Result<(), ProjectionError> {
        let at = event.occurred_at;
        match &event.payload {
            EventPayload::OrderAcknowledged {
                venue_order_id,
                status,
            } => {
                self.check_transition(*status)?;
                self.venue_order_id = Some(venue_order_id.clone());
                self.set_status(*status, at)?;
            }
            EventPayload::OrderPartiallyFilled {
                filled_quantity,
                average_fill_price,
                fee,
                fee_currency,
            } => {
                self.record_fill(
                    *filled_quantity,
                    *average_fill_price,
                    *fee,
                    fee_currency.clone(),
                    at,
                )?;
            }
            EventPayload::OrderFilled {
                filled_quantity,
                average_fill_price,
                fee,
                fee_currency,
            } => {
                if *filled_quantity != self.requested_quantity {
                    return Err(unexpected(self, event));
                }
                self.record_fill(
                    *filled_quantity,
                    *average_fill_price,
                    *fee,
                    fee_currency.clone(),
                    at,
                )?;
            }
            EventPayload::OrderCancelled {
                filled_quantity, ..
            } => {
                self.check_fill(*filled_quantity)?;
                self.check_transition(OrderStatus::Cancelled)?;
                self.filled_quantity = *filled_quantity;
                self.set_status(OrderStatus::Cancelled, at)?;
            }
            EventPayload::OrderFailed { .. } => {
                self.set_status(OrderStatus::Failed, at)?;
            }
            // Audit marker only
            EventPayload::OrderUnreconciled { .. } => {}
            _ => return Err(unexpected(self, event)),
        }
        Ok(())
    }
}

impl Aggregate for Position {
    const NAME: &'static str = "position";

    fn id(&self) -> Uuid {
        self.id
    }

    fn create(event: &DomainEvent) -> Result<Self, ProjectionError> {
        match &event.payload {
            EventPayload::PositionOpened { position } => Ok(position.clone()),
            _ => Err(ProjectionError::NotACreationEvent {
                aggregate: Self::NAME,
                event_type: event.event_type(),
            }),
        }
    }

    fn apply(&mut self, event: &DomainEvent) -> Result<(), ProjectionError> {
        if self.status == PositionStatus::Closed {
            return Err(unexpected(self, event));
        }

        let at = event.occurred_at;
        match &event.payload {
            EventPayload::TrailingStopAdjusted {
                best_price,
                stop_price,
                distance_pct,
            } => {
                self.best_price = *best_price;
                self.trailing_stop_price = Some(*stop_price);
                self.trailing_stop_distance = Some(*distance_pct);
            }
            EventPayload::StopLossTriggered { .. } => {
                self.request_exit(ExitReason::StopLoss, None, event)?;
            }
            EventPayload::TakeProfitTriggered { close_quantity, .. } => {
                self.request_exit(ExitReason::TakeProfit, *close_quantity, event)?;
            }
            EventPayload::TrailingStopTriggered { .. } => {
                self.request_exit(ExitReason::TrailingStop, None, event)?;
            }
            EventPayload::EmergencyExitTriggered { .. } => {
                self.request_exit(ExitReason::EmergencyExit, None, event)?;
            }
            EventPayload::ExitRequested { reason, quantity } => {
                self.request_exit(*reason, *quantity, event)?;
            }
            EventPayload::ExitOrderPlaced { order_id } => {
                let awaiting_order = matches!(&self.pending_exit, Some(p) if p.order_id.is_none());
                if !awaiting_order {
                    return Err(unexpected(self, event));
                }
                if let Some(pending) = self.pending_exit.as_mut() {
                    pending.order_id = Some(*order_id);
                }
            }
            EventPayload::ExitOrderReleased { failed, .. } => {
                if self.pending_exit.take().is_none() {
                    return Err(unexpected(self, event));
                }
                if *failed {
                    self.exit_failures += 1;
                }
            }
            EventPayload::PositionReduced {
                realized_pnl,
                remaining,
                ..
            } => {
                let pending = self.pending_exit.take();
                if pending.as_ref().map(|p| p.reason) == Some(ExitReason::TakeProfit) {
                    self.partial_take_profit_done = true;
                }
                self.quantity = *remaining;
                self.realized_pnl += *realized_pnl;
                self.realized_pnl_pct = self.realized_pct();
            }
            EventPayload::PositionClosed {
                exit_price,
                realized_pnl,
                realized_pnl_pct,
                ..
            } => {
                let pending = self.pending_exit.take();
                self.exit_reason = Some(pending.map(|p| p.reason).unwrap_or(ExitReason::Manual));
                self.status = PositionStatus::Closed;
                self.exit_price = Some(*exit_price);
                self.closed_at = Some(at);
                self.realized_pnl = *realized_pnl;
                self.realized_pnl_pct = *realized_pnl_pct;
            }
            EventPayload::ManualInterventionRequired { .. } => {
                self.requires_intervention = true;
            }
            _ => return Err(unexpected(self, event)),
        }
        self.updated_at = at;
        Ok(())
    }
}

impl Position {
    fn request_exit(
        &mut self,
        reason: ExitReason,
        quantity: Option<rust_decimal::Decimal>,
        event: &DomainEvent,
    ) -> Result<(), ProjectionError> {
        if self.pending_exit.is_some() {
            return Err(unexpected(self, event));
        }
        self.pending_exit = Some(PendingExit {
            reason,
            quantity,
            order_id: None,
            requested_at: event.occurred_at,
        });
        Ok(())
    }

    /// Realized P&L as a percentage of the entry notional closed so far.
    pub fn realized_pct(&self) -> rust_decimal::Decimal {
        let closed = self.initial_quantity - self.quantity;
        let basis = self.entry_price * closed;
        if basis.is_zero() {
            return rust_decimal::Decimal::ZERO;
        }
        self.realized_pnl / basis * rust_decimal::Decimal::ONE_HUNDRED
    }
}
