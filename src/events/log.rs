use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use super::{DomainEvent, EventType};
use crate::error::EventLogError;
use crate::persistence::EventRepository;
use crate::shutdown::{Shutdown, ShutdownReason};

pub type EventStream = BoxStream<'static, Result<DomainEvent, EventLogError>>;

#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub write_timeout: Duration,
    pub max_write_attempts: u32,
    pub replay_page_size: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
            max_write_attempts: 3,
            replay_page_size: 256,
        }
    }
}

/// Durable, ordered, append-only event log.
///
/// A write that cannot be completed after the configured attempts triggers a fatal shutdown:
/// the process must not keep trading without its audit trail.
#[derive(Clone)]
pub struct EventLog {
    repo: Arc<dyn EventRepository>,
    config: EventLogConfig,
    shutdown: Shutdown,
}

impl EventLog {
    pub fn new(repo: Arc<dyn EventRepository>, config: EventLogConfig, shutdown: Shutdown) -> Self {
        Self {
            repo,
            config,
            shutdown,
        }
    }

    pub async fn append(&self, event: DomainEvent) -> Result<DomainEvent, EventLogError> {
        if self.shutdown.reason() == Some(ShutdownReason::EventLogFailure) {
            return Err(EventLogError::Unavailable {
                attempts: 0,
                message: "event log already failed".to_string(),
            });
        }

        let attempts = self.config.max_write_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match timeout(self.config.write_timeout, self.repo.append(event.clone())).await {
                Ok(Ok(stored)) => {
                    tracing::debug!(
                        event_type = %stored.event_type(),
                        aggregate_id = %stored.aggregate_id,
                        sequence = stored.sequence,
                        "event appended"
                    );
                    return Ok(stored);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("write timed out after {:?}", self.config.write_timeout),
            }

            // A write that timed out or errored may still have committed
            if let Some(stored) = self.already_stored(&event).await {
                tracing::debug!(
                    event_type = %stored.event_type(),
                    aggregate_id = %stored.aggregate_id,
                    sequence = stored.sequence,
                    "event found stored after failed write: {}",
                    last_error
                );
                return Ok(stored);
            }

            tracing::warn!(
                "Event log write attempt {}/{} failed for {} ({}): {}",
                attempt,
                attempts,
                event.event_type(),
                event.aggregate_id,
                last_error
            );
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
            }
        }

        tracing::error!(
            "🛑 Event log unavailable, stopping: {} for {} could not be recorded ({})",
            event.event_type(),
            event.aggregate_id,
            last_error
        );
        self.shutdown.trigger(ShutdownReason::EventLogFailure);

        Err(EventLogError::Unavailable {
            attempts,
            message: last_error,
        })
    }

    async fn already_stored(&self, event: &DomainEvent) -> Option<DomainEvent> {
        match timeout(self.config.write_timeout, self.repo.get_event(event.id)).await {
            Ok(Ok(Some(stored))) => Some(stored),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                tracing::debug!("Lookup of event {} failed: {}", event.id, e);
                None
            }
            Err(_) => None,
        }
    }

    /// Lazy, finite replay of one aggregate in sequence order.
    ///
    /// Pages are fetched on demand; calling again starts a fresh pass from the beginning.
    pub fn replay(&self, aggregate_id: Uuid) -> EventStream {
        self.replay_from(aggregate_id, 0)
    }

    /// Replay events with `sequence > after_sequence`, for resuming an interrupted pass.
    pub fn replay_from(&self, aggregate_id: Uuid, after_sequence: i64) -> EventStream {
        let repo = self.repo.clone();
        let page_size = self.config.replay_page_size.max(1);
        let read_timeout = self.config.write_timeout;

        stream::try_unfold(Some(after_sequence), move |cursor| {
            let repo = repo.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok::<_, EventLogError>(None);
                };
                let page = timeout(read_timeout, repo.list_by_aggregate(aggregate_id, after, page_size))
                    .await
                    .map_err(|_| EventLogError::Unavailable {
                        attempts: 1,
                        message: format!("replay page read timed out after {:?}", read_timeout),
                    })??;

                if page.is_empty() {
                    return Ok::<_, EventLogError>(None);
                }
                let next = if page.len() < page_size {
                    None
                } else {
                    page.last().map(|e| e.sequence)
                };
                Ok(Some((page, next)))
            }
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, EventLogError>)))
        .try_flatten()
        .boxed()
    }

    pub async fn history(&self, aggregate_id: Uuid) -> Result<Vec<DomainEvent>, EventLogError> {
        self.replay(aggregate_id).try_collect().await
    }

    pub async fn recent(
        &self,
        event_type: EventType,
        limit: usize,
    ) -> Result<Vec<DomainEvent>, EventLogError> {
        let events = timeout(self.config.write_timeout, self.repo.list_by_type(event_type, limit))
            .await
            .map_err(|_| EventLogError::Unavailable {
                attempts: 1,
                message: "event query timed out".to_string(),
            })??;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepositoryError;
    use crate::events::EventPayload;
    use crate::persistence::{InMemoryStore, RepoResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct BrokenRepository;

    #[async_trait]
    impl EventRepository for BrokenRepository {
        async fn append(&self, _event: DomainEvent) -> RepoResult<DomainEvent> {
            Err(RepositoryError::Corrupt("disk on fire".into()))
        }

        async fn list_by_aggregate(&self, _: Uuid, _: i64, _: usize) -> RepoResult<Vec<DomainEvent>> {
            Ok(Vec::new())
        }

        async fn list_by_type(&self, _: EventType, _: usize) -> RepoResult<Vec<DomainEvent>> {
            Ok(Vec::new())
        }

        async fn get_event(&self, _: Uuid) -> RepoResult<Option<DomainEvent>> {
            Ok(None)
        }
    }

    /// Commits every write, but the first acknowledgement never arrives.
    struct LostAckRepository {
        inner: InMemoryStore,
        lost: AtomicBool,
    }

    #[async_trait]
    impl EventRepository for LostAckRepository {
        async fn append(&self, event: DomainEvent) -> RepoResult<DomainEvent> {
            let stored = self.inner.append(event).await?;
            if !self.lost.swap(true, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(stored)
        }

        async fn list_by_aggregate(&self, id: Uuid, after: i64, limit: usize) -> RepoResult<Vec<DomainEvent>> {
            self.inner.list_by_aggregate(id, after, limit).await
        }

        async fn list_by_type(&self, event_type: EventType, limit: usize) -> RepoResult<Vec<DomainEvent>> {
            self.inner.list_by_type(event_type, limit).await
        }

        async fn get_event(&self, id: Uuid) -> RepoResult<Option<DomainEvent>> {
            self.inner.get_event(id).await
        }
    }

    fn resumed(n: usize) -> EventPayload {
        EventPayload::TradingResumed {
            reason: format!("event {}", n),
        }
    }

    fn small_pages() -> EventLogConfig {
        EventLogConfig {
            replay_page_size: 2,
            ..EventLogConfig::default()
        }
    }

    #[tokio::test]
    async fn test_replay_pages_through_everything_in_order() {
        let log = EventLog::new(Arc::new(InMemoryStore::new()), small_pages(), Shutdown::new());
        let aggregate = Uuid::new_v4();
        for n in 0..5 {
            log.append(DomainEvent::new(aggregate, resumed(n))).await.unwrap();
        }
        log.append(DomainEvent::new(Uuid::new_v4(), resumed(99)))
            .await
            .unwrap();

        let events = log.history(aggregate).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_replay_is_restartable() {
        let log = EventLog::new(Arc::new(InMemoryStore::new()), small_pages(), Shutdown::new());
        let aggregate = Uuid::new_v4();
        for n in 0..3 {
            log.append(DomainEvent::new(aggregate, resumed(n))).await.unwrap();
        }

        let mut partial = log.replay(aggregate);
        let first = partial.next().await.unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        drop(partial);

        assert_eq!(log.history(aggregate).await.unwrap().len(), 3);
        let rest: Vec<_> = log.replay_from(aggregate, 1).try_collect().await.unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_is_fatal() {
        let shutdown = Shutdown::new();
        let log = EventLog::new(Arc::new(BrokenRepository), EventLogConfig::default(), shutdown.clone());

        let err = log
            .append(DomainEvent::new(Uuid::new_v4(), resumed(0)))
            .await
            .unwrap_err();

        assert!(matches!(err, EventLogError::Unavailable { attempts: 3, .. }));
        assert_eq!(shutdown.reason(), Some(ShutdownReason::EventLogFailure));
    }

    #[tokio::test(start_paused = true)]
    async fn test_committed_write_with_lost_ack_is_not_fatal() {
        let shutdown = Shutdown::new();
        let repo = Arc::new(LostAckRepository {
            inner: InMemoryStore::new(),
            lost: AtomicBool::new(false),
        });
        let log = EventLog::new(repo.clone(), EventLogConfig::default(), shutdown.clone());
        let aggregate = Uuid::new_v4();

        let event = DomainEvent::new(aggregate, resumed(0));
        let stored = log.append(event.clone()).await.unwrap();
        assert_eq!(stored.id, event.id);
        assert_eq!(stored.sequence, 1);
        assert_eq!(shutdown.reason(), None);

        // Recorded once, and later writes carry on normally
        assert_eq!(repo.inner.event_count().await, 1);
        let next = log.append(DomainEvent::new(aggregate, resumed(1))).await.unwrap();
        assert_eq!(next.sequence, 2);
    }
}
