// Repository contracts and their storage adapters
pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::events::{DomainEvent, EventType};
use crate::models::{Order, Parameters, Position, Timeframe};

pub type RepoResult<T> = std::result::Result<T, RepositoryError>;

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create(&self, order: &Order) -> RepoResult<()>;
    async fn get(&self, id: Uuid) -> RepoResult<Option<Order>>;
    async fn update(&self, order: &Order) -> RepoResult<()>;
    /// Orders that have not reached a terminal status
    async fn list_open(&self) -> RepoResult<Vec<Order>>;
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn create(&self, position: &Position) -> RepoResult<()>;
    async fn get(&self, id: Uuid) -> RepoResult<Option<Position>>;
    async fn update(&self, position: &Position) -> RepoResult<()>;
    async fn list_open(&self) -> RepoResult<Vec<Position>>;
    async fn list_all(&self) -> RepoResult<Vec<Position>>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Store the event and return it with its per-aggregate sequence number assigned.
    async fn append(&self, event: DomainEvent) -> RepoResult<DomainEvent>;

    /// Events of one aggregate with `sequence > after_sequence`, in sequence order.
    async fn list_by_aggregate(
        &self,
        aggregate_id: Uuid,
        after_sequence: i64,
        limit: usize,
    ) -> RepoResult<Vec<DomainEvent>>;

    /// Most recent events of one type, newest first.
    async fn list_by_type(&self, event_type: EventType, limit: usize) -> RepoResult<Vec<DomainEvent>>;

    /// A stored event by its id, with its assigned sequence.
    async fn get_event(&self, id: Uuid) -> RepoResult<Option<DomainEvent>>;
}

/// One configured (strategy, pair, timeframe, venue) tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    /// Unique id of this tuple; also the `strategy_id` on its orders and positions
    pub id: String,
    /// Registered strategy plugin name
    pub strategy: String,
    pub pair: String,
    pub timeframe: Timeframe,
    pub venue: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[async_trait]
pub trait StrategyRepository: Send + Sync {
    async fn create(&self, record: &StrategyRecord) -> RepoResult<()>;
    async fn get(&self, id: &str) -> RepoResult<Option<StrategyRecord>>;
    async fn update(&self, record: &StrategyRecord) -> RepoResult<()>;
    async fn list_enabled(&self) -> RepoResult<Vec<StrategyRecord>>;
}
