use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::{
    EventRepository, OrderRepository, PositionRepository, RepoResult, StrategyRecord,
    StrategyRepository,
};
use crate::error::RepositoryError;
use crate::events::{DomainEvent, EventPayload, EventType};
use crate::models::{Order, Parameters, Position, Timeframe};

/// Postgres storage for orders, positions, strategy tuples and the event log.
///
/// Orders and positions keep their full document in a `data` JSONB column next to the
/// columns used for filtering.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run pending migrations
    pub async fn connect(database_url: &str) -> RepoResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| RepositoryError::Database(e.into()))?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn conflict_or(err: sqlx::Error, what: impl Into<String>) -> RepositoryError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(what.into()),
        _ => RepositoryError::Database(err),
    }
}

fn decode_data<T: serde::de::DeserializeOwned>(row: &PgRow) -> RepoResult<T> {
    let data: serde_json::Value = row.try_get("data")?;
    Ok(serde_json::from_value(data)?)
}

fn row_to_event(row: &PgRow) -> RepoResult<DomainEvent> {
    let id: Uuid = row.try_get("id")?;
    let aggregate_id: Uuid = row.try_get("aggregate_id")?;
    let sequence: i64 = row.try_get("sequence")?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at")?;
    let stored_type: String = row.try_get("event_type")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    let payload: EventPayload = serde_json::from_value(payload)?;

    if payload.event_type().as_str() != stored_type {
        return Err(RepositoryError::Corrupt(format!(
            "event {} stored as {} but payload is {}",
            id,
            stored_type,
            payload.event_type()
        )));
    }

    Ok(DomainEvent {
        id,
        aggregate_id,
        aggregate_type: payload.aggregate_type(),
        sequence,
        occurred_at,
        payload,
    })
}

fn row_to_strategy(row: &PgRow) -> RepoResult<StrategyRecord> {
    let timeframe: String = row.try_get("timeframe")?;
    let timeframe: Timeframe = timeframe
        .parse()
        .map_err(|e: String| RepositoryError::Corrupt(e))?;
    let parameters: serde_json::Value = row.try_get("parameters")?;
    let parameters: Parameters = serde_json::from_value(parameters)?;

    Ok(StrategyRecord {
        id: row.try_get("id")?,
        strategy: row.try_get("strategy")?,
        pair: row.try_get("pair")?,
        timeframe,
        venue: row.try_get("venue")?,
        parameters,
        enabled: row.try_get("enabled")?,
    })
}

#[async_trait]
impl OrderRepository for PostgresStore {
    async fn create(&self, order: &Order) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, venue_order_id, strategy_id, venue, pair, side, status,
                requested_quantity, filled_quantity, data, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(order.id)
        .bind(&order.venue_order_id)
        .bind(&order.strategy_id)
        .bind(&order.venue)
        .bind(&order.pair)
        .bind(order.side.as_str())
        .bind(order.status.as_str())
        .bind(order.requested_quantity)
        .bind(order.filled_quantity)
        .bind(serde_json::to_value(order)?)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or(e, format!("order {}", order.id)))?;

        tracing::debug!("Saved order {} for {} to Postgres", order.id, order.pair);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> RepoResult<Option<Order>> {
        let row = sqlx::query("SELECT data FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_data).transpose()
    }

    async fn update(&self, order: &Order) -> RepoResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                venue_order_id = $2,
                status = $3,
                filled_quantity = $4,
                data = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(order.id)
        .bind(&order.venue_order_id)
        .bind(order.status.as_str())
        .bind(order.filled_quantity)
        .bind(serde_json::to_value(order)?)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("order {}", order.id)));
        }
        Ok(())
    }

    async fn list_open(&self) -> RepoResult<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM orders
            WHERE status IN ('pending', 'open', 'partially_filled')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_data).collect()
    }
}

#[async_trait]
impl PositionRepository for PostgresStore {
    async fn create(&self, position: &Position) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, strategy_id, venue, pair, side, status, quantity,
                entry_price, realized_pnl, data, opened_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(position.id)
        .bind(&position.strategy_id)
        .bind(&position.venue)
        .bind(&position.pair)
        .bind(position.side.as_str())
        .bind(position.status.as_str())
        .bind(position.quantity)
        .bind(position.entry_price)
        .bind(position.realized_pnl)
        .bind(serde_json::to_value(position)?)
        .bind(position.opened_at)
        .bind(position.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or(e, format!("position {}", position.id)))?;

        tracing::debug!(
            "Saved position {} for {} to Postgres",
            position.id,
            position.pair
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> RepoResult<Option<Position>> {
        let row = sqlx::query("SELECT data FROM positions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_data).transpose()
    }

    async fn update(&self, position: &Position) -> RepoResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE positions SET
                status = $2,
                quantity = $3,
                realized_pnl = $4,
                data = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(position.id)
        .bind(position.status.as_str())
        .bind(position.quantity)
        .bind(position.realized_pnl)
        .bind(serde_json::to_value(position)?)
        .bind(position.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("position {}", position.id)));
        }
        Ok(())
    }

    async fn list_open(&self) -> RepoResult<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT data FROM positions WHERE status = 'open' ORDER BY opened_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_data).collect()
    }

    async fn list_all(&self) -> RepoResult<Vec<Position>> {
        let rows = sqlx::query("SELECT data FROM positions ORDER BY opened_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_data).collect()
    }
}

#[async_trait]
impl EventRepository for PostgresStore {
    async fn append(&self, mut event: DomainEvent) -> RepoResult<DomainEvent> {
        let mut tx = self.pool.begin().await?;

        // Serializes appends per aggregate; released at commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
            .bind(event.aggregate_id)
            .execute(&mut *tx)
            .await?;

        let next: i64 = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) + 1 AS next FROM domain_events WHERE aggregate_id = $1",
        )
        .bind(event.aggregate_id)
        .fetch_one(&mut *tx)
        .await?
        .try_get("next")?;
        event.sequence = next;

        sqlx::query(
            r#"
            INSERT INTO domain_events (
                id, aggregate_id, aggregate_type, sequence, event_type, payload, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.aggregate_id)
        .bind(event.aggregate_type.as_str())
        .bind(event.sequence)
        .bind(event.event_type().as_str())
        .bind(serde_json::to_value(&event.payload)?)
        .bind(event.occurred_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            conflict_or(
                e,
                format!("event {} #{}", event.aggregate_id, event.sequence),
            )
        })?;

        tx.commit().await?;
        Ok(event)
    }

    async fn list_by_aggregate(
        &self,
        aggregate_id: Uuid,
        after_sequence: i64,
        limit: usize,
    ) -> RepoResult<Vec<DomainEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_id, sequence, event_type, payload, occurred_at
            FROM domain_events
            WHERE aggregate_id = $1 AND sequence > $2
            ORDER BY sequence ASC
            LIMIT $3
            "#,
        )
        .bind(aggregate_id)
        .bind(after_sequence)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn list_by_type(&self, event_type: EventType, limit: usize) -> RepoResult<Vec<DomainEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_id, sequence, event_type, payload, occurred_at
            FROM domain_events
            WHERE event_type = $1
            ORDER BY global_position DESC
            LIMIT $2
            "#,
        )
        .bind(event_type.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn get_event(&self, id: Uuid) -> RepoResult<Option<DomainEvent>> {
        let row = sqlx::query(
            r#"
            SELECT id, aggregate_id, sequence, event_type, payload, occurred_at
            FROM domain_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_event).transpose()
    }
}

#[async_trait]
impl StrategyRepository for PostgresStore {
    async fn create(&self, record: &StrategyRecord) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO strategies (id, strategy, pair, timeframe, venue, parameters, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.id)
        .bind(&record.strategy)
        .bind(&record.pair)
        .bind(record.timeframe.as_str())
        .bind(&record.venue)
        .bind(serde_json::Value::Object(record.parameters.clone()))
        .bind(record.enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or(e, format!("strategy {}", record.id)))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> RepoResult<Option<StrategyRecord>> {
        let row = sqlx::query(
            "SELECT id, strategy, pair, timeframe, venue, parameters, enabled FROM strategies WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_strategy).transpose()
    }

    async fn update(&self, record: &StrategyRecord) -> RepoResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE strategies SET
                strategy = $2,
                pair = $3,
                timeframe = $4,
                venue = $5,
                parameters = $6,
                enabled = $7,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(&record.id)
        .bind(&record.strategy)
        .bind(&record.pair)
        .bind(record.timeframe.as_str())
        .bind(&record.venue)
        .bind(serde_json::Value::Object(record.parameters.clone()))
        .bind(record.enabled)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("strategy {}", record.id)));
        }
        Ok(())
    }

    async fn list_enabled(&self) -> RepoResult<Vec<StrategyRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, strategy, pair, timeframe, venue, parameters, enabled
            FROM strategies
            WHERE enabled
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_strategy).collect()
    }
}
