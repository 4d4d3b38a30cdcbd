use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use common::{AggregateId, SequenceNumber};
use messaging::DomainEventMessage;

use crate::error::{EventStoreError, Result};
use crate::query::EventCriteria;

/// Options for appending events to the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected last sequence of the aggregate for optimistic concurrency
    /// control. If None, only the gap-free invariant is enforced.
    pub expected_sequence: Option<SequenceNumber>,
}

impl AppendOptions {
    /// Creates options with no expected-sequence check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the aggregate's stream to end at `sequence`.
    pub fn expect_sequence(sequence: SequenceNumber) -> Self {
        Self {
            expected_sequence: Some(sequence),
        }
    }

    /// Creates options expecting the aggregate to not exist yet.
    pub fn expect_new() -> Self {
        Self {
            expected_sequence: Some(SequenceNumber::initial()),
        }
    }
}

/// A stream of historical events, delivered one event per poll in
/// storage-native order. Used for replay scanning.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<DomainEventMessage>> + Send>>;

/// Core trait for event store implementations.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events for one aggregate of the given type.
    ///
    /// Events are appended atomically. The append fails with
    /// [`EventStoreError::ConcurrencyConflict`] when the aggregate's
    /// current last sequence does not match `options.expected_sequence`
    /// (when set), or when the new events would break the gap-free
    /// sequence invariant.
    ///
    /// Returns the aggregate's last sequence after appending.
    async fn append_events(
        &self,
        aggregate_type: &str,
        events: Vec<DomainEventMessage>,
        options: AppendOptions,
    ) -> Result<SequenceNumber>;

    /// Retrieves all events for a specific aggregate, in sequence order.
    async fn read_events(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Vec<DomainEventMessage>>;

    /// Gets the last sequence number of an aggregate.
    ///
    /// Returns None if the aggregate has no events.
    async fn last_sequence_number(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<SequenceNumber>>;

    /// Streams historical events matching `criteria` (all events when
    /// None), in storage insertion order. Used only for replay scanning.
    async fn stream_events(&self, criteria: Option<EventCriteria>) -> Result<EventStream>;
}

/// Validates events before appending: the batch must be non-empty, target
/// a single aggregate, and carry consecutive sequence numbers.
pub fn validate_events_for_append(events: &[DomainEventMessage]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "cannot append an empty event list".to_string(),
        ));
    };

    for event in events.iter().skip(1) {
        if event.aggregate_id != first.aggregate_id {
            return Err(EventStoreError::InvalidAppend(
                "all events must belong to the same aggregate".to_string(),
            ));
        }
    }

    let mut expected = first.sequence_number;
    for event in events.iter().skip(1) {
        expected = expected.next();
        if event.sequence_number != expected {
            return Err(EventStoreError::InvalidAppend(format!(
                "event sequences must be consecutive: expected {}, got {}",
                expected, event.sequence_number
            )));
        }
    }

    Ok(())
}
