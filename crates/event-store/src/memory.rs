use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use common::{AggregateId, SequenceNumber};
use messaging::DomainEventMessage;

use crate::error::{EventStoreError, Result};
use crate::query::EventCriteria;
use crate::store::{AppendOptions, EventStore, EventStream, validate_events_for_append};

/// One event as recorded by the store, tagged with its aggregate type.
#[derive(Debug, Clone)]
struct StoredEvent {
    aggregate_type: String,
    event: DomainEventMessage,
}

/// In-memory event store implementation.
///
/// Stores events in insertion order and enforces the same optimistic
/// concurrency and gap-free sequence rules a durable implementation would.
/// Cloning shares the underlying storage.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    /// Clears all events.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_events(
        &self,
        aggregate_type: &str,
        events: Vec<DomainEventMessage>,
        options: AppendOptions,
    ) -> Result<SequenceNumber> {
        validate_events_for_append(&events)?;

        let first = &events[0];
        let aggregate_id = first.aggregate_id;

        let mut store = self.events.write().await;

        let current = store
            .iter()
            .filter(|e| e.aggregate_type == aggregate_type && e.event.aggregate_id == aggregate_id)
            .map(|e| e.event.sequence_number)
            .max()
            .unwrap_or(SequenceNumber::initial());

        if let Some(expected) = options.expected_sequence
            && current != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual: current,
            });
        }

        // The batch must continue the stream without gaps or overlaps.
        if first.sequence_number != current.next() {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: first.sequence_number.previous(),
                actual: current,
            });
        }

        let last = events
            .last()
            .map(|e| e.sequence_number)
            .unwrap_or(SequenceNumber::initial());
        store.extend(events.into_iter().map(|event| StoredEvent {
            aggregate_type: aggregate_type.to_string(),
            event,
        }));

        Ok(last)
    }

    async fn read_events(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Vec<DomainEventMessage>> {
        let store = self.events.read().await;
        let mut events: Vec<_> = store
            .iter()
            .filter(|e| e.aggregate_type == aggregate_type && e.event.aggregate_id == aggregate_id)
            .map(|e| e.event.clone())
            .collect();
        events.sort_by_key(|e| e.sequence_number);
        Ok(events)
    }

    async fn last_sequence_number(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<SequenceNumber>> {
        let store = self.events.read().await;
        let last = store
            .iter()
            .filter(|e| e.aggregate_type == aggregate_type && e.event.aggregate_id == aggregate_id)
            .map(|e| e.event.sequence_number)
            .max();
        Ok(last)
    }

    async fn stream_events(&self, criteria: Option<EventCriteria>) -> Result<EventStream> {
        use futures_util::stream;

        let store = self.events.read().await;
        let criteria = criteria.unwrap_or_default();
        let events: Vec<_> = store
            .iter()
            .filter(|e| criteria.matches(&e.aggregate_type, &e.event))
            .map(|e| e.event.clone())
            .collect();

        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }
}
