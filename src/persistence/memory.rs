use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    EventRepository, OrderRepository, PositionRepository, RepoResult, StrategyRecord,
    StrategyRepository,
};
use crate::error::RepositoryError;
use crate::events::{DomainEvent, EventType};
use crate::models::{Order, Position};

/// In-process repositories for dry-run without a database, and for tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    orders: RwLock<HashMap<Uuid, Order>>,
    positions: RwLock<HashMap<Uuid, Position>>,
    events: RwLock<EventTable>,
    strategies: RwLock<HashMap<String, StrategyRecord>>,
}

#[derive(Debug, Default)]
struct EventTable {
    by_aggregate: HashMap<Uuid, Vec<DomainEvent>>,
    // Global append order, for type queries
    all: Vec<(Uuid, usize)>,
    by_id: HashMap<Uuid, (Uuid, usize)>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn event_count(&self) -> usize {
        self.events.read().await.all.len()
    }
}

#[async_trait]
impl OrderRepository for InMemoryStore {
    async fn create(&self, order: &Order) -> RepoResult<()> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(RepositoryError::Conflict(format!("order {} exists", order.id)));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> RepoResult<Option<Order>> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn update(&self, order: &Order) -> RepoResult<()> {
        let mut orders = self.orders.write().await;
        match orders.get_mut(&order.id) {
            Some(slot) => {
                *slot = order.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!("order {}", order.id))),
        }
    }

    async fn list_open(&self) -> RepoResult<Vec<Order>> {
        let mut open: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| !o.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|o| o.created_at);
        Ok(open)
    }
}

#[async_trait]
impl PositionRepository for InMemoryStore {
    async fn create(&self, position: &Position) -> RepoResult<()> {
        let mut positions = self.positions.write().await;
        if positions.contains_key(&position.id) {
            return Err(RepositoryError::Conflict(format!(
                "position {} exists",
                position.id
            )));
        }
        positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> RepoResult<Option<Position>> {
        Ok(self.positions.read().await.get(&id).cloned())
    }

    async fn update(&self, position: &Position) -> RepoResult<()> {
        let mut positions = self.positions.write().await;
        match positions.get_mut(&position.id) {
            Some(slot) => {
                *slot = position.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!("position {}", position.id))),
        }
    }

    async fn list_open(&self) -> RepoResult<Vec<Position>> {
        let mut open: Vec<Position> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|p| p.opened_at);
        Ok(open)
    }

    async fn list_all(&self) -> RepoResult<Vec<Position>> {
        let mut all: Vec<Position> = self.positions.read().await.values().cloned().collect();
        all.sort_by_key(|p| p.opened_at);
        Ok(all)
    }
}

#[async_trait]
impl EventRepository for InMemoryStore {
    async fn append(&self, mut event: DomainEvent) -> RepoResult<DomainEvent> {
        let mut table = self.events.write().await;
        if table.by_id.contains_key(&event.id) {
            return Err(RepositoryError::Conflict(format!("event {} exists", event.id)));
        }
        let stream = table.by_aggregate.entry(event.aggregate_id).or_default();
        event.sequence = stream.len() as i64 + 1;
        stream.push(event.clone());
        let index = stream.len() - 1;
        table.all.push((event.aggregate_id, index));
        table.by_id.insert(event.id, (event.aggregate_id, index));
        Ok(event)
    }

    async fn list_by_aggregate(
        &self,
        aggregate_id: Uuid,
        after_sequence: i64,
        limit: usize,
    ) -> RepoResult<Vec<DomainEvent>> {
        let table = self.events.read().await;
        Ok(table
            .by_aggregate
            .get(&aggregate_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.sequence > after_sequence)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_by_type(&self, event_type: EventType, limit: usize) -> RepoResult<Vec<DomainEvent>> {
        let table = self.events.read().await;
        Ok(table
            .all
            .iter()
            .rev()
            .filter_map(|(aggregate_id, index)| {
                table.by_aggregate.get(aggregate_id).and_then(|s| s.get(*index))
            })
            .filter(|e| e.event_type() == event_type)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_event(&self, id: Uuid) -> RepoResult<Option<DomainEvent>> {
        let table = self.events.read().await;
        Ok(table
            .by_id
            .get(&id)
            .and_then(|(aggregate_id, index)| table.by_aggregate.get(aggregate_id)?.get(*index))
            .cloned())
    }
}

#[async_trait]
impl StrategyRepository for InMemoryStore {
    async fn create(&self, record: &StrategyRecord) -> RepoResult<()> {
        let mut strategies = self.strategies.write().await;
        if strategies.contains_key(&record.id) {
            return Err(RepositoryError::Conflict(format!("strategy {} exists", record.id)));
        }
        strategies.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> RepoResult<Option<StrategyRecord>> {
        Ok(self.strategies.read().await.get(id).cloned())
    }

    async fn update(&self, record: &StrategyRecord) -> RepoResult<()> {
        let mut strategies = self.strategies.write().await;
        match strategies.get_mut(&record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!("strategy {}", record.id))),
        }
    }

    async fn list_enabled(&self) -> RepoResult<Vec<StrategyRecord>> {
        let mut enabled: Vec<StrategyRecord> = self
            .strategies
            .read()
            .await
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        enabled.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;

    fn resumed() -> EventPayload {
        EventPayload::TradingResumed {
            reason: "test".into(),
        }
    }

    #[tokio::test]
    async fn test_sequences_are_per_aggregate() {
        let store = InMemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let e1 = store.append(DomainEvent::new(a, resumed())).await.unwrap();
        let e2 = store.append(DomainEvent::new(b, resumed())).await.unwrap();
        let e3 = store.append(DomainEvent::new(a, resumed())).await.unwrap();

        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 1);
        assert_eq!(e3.sequence, 2);
        assert_eq!(store.event_count().await, 3);
    }

    #[tokio::test]
    async fn test_list_by_aggregate_pages() {
        let store = InMemoryStore::new();
        let a = Uuid::new_v4();
        for _ in 0..5 {
            store.append(DomainEvent::new(a, resumed())).await.unwrap();
        }

        let page = store.list_by_aggregate(a, 2, 2).await.unwrap();
        let seqs: Vec<i64> = page.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_list_by_type_newest_first() {
        let store = InMemoryStore::new();
        let first = store
            .append(DomainEvent::new(Uuid::new_v4(), resumed()))
            .await
            .unwrap();
        let second = store
            .append(DomainEvent::new(Uuid::new_v4(), resumed()))
            .await
            .unwrap();

        let found = store.list_by_type(EventType::TradingResumed, 10).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, second.id);
        assert_eq!(found[1].id, first.id);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_conflicts() {
        let store = InMemoryStore::new();
        let event = DomainEvent::new(Uuid::new_v4(), resumed());
        let stored = store.append(event.clone()).await.unwrap();

        let err = store.append(event.clone()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(store.event_count().await, 1);
        assert_eq!(store.get_event(event.id).await.unwrap(), Some(stored));
        assert!(store.get_event(Uuid::new_v4()).await.unwrap().is_none());
    }
}
