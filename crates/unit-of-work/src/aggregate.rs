//! Event-sourced aggregate model.

use std::any::Any;

use serde::{Serialize, de::DeserializeOwned};

use common::{AggregateId, SequenceNumber};
use messaging::{DomainEventMessage, MetaData};

use crate::error::AggregateError;

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name.
    ///
    /// This is used for serialization and event store filtering.
    fn event_type(&self) -> &'static str;
}

/// Trait for the state of an event-sourced aggregate.
///
/// An aggregate is a consistency boundary whose state changes are captured
/// as an ordered sequence of domain events. Implementations:
/// - are rebuilt by replaying events
/// - apply events to update state (pure, deterministic)
pub trait Aggregate: Default + Send + 'static {
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Returns the aggregate type name.
    ///
    /// Used for event store organization and routing.
    fn aggregate_type() -> &'static str;

    /// Applies an event to the aggregate, updating its state.
    ///
    /// This method must be pure and deterministic:
    /// - Given the same state and event, it must always produce the same new state
    /// - It must not have side effects
    /// - It must not fail (events represent facts that have happened)
    fn apply(&mut self, event: Self::Event);
}

/// Callback invoked for every event an aggregate raises.
///
/// Installed by the unit of work at registration so raised events flow
/// through the listener chain and into the delivery buffer. The returned
/// message (metadata may differ, identity and payload never do) is what
/// ends up in the aggregate's uncommitted queue.
pub type EventRegistrationCallback =
    Box<dyn FnMut(DomainEventMessage) -> DomainEventMessage + Send>;

/// Object-safe view of a registered aggregate, as held by a unit of work.
pub trait AggregateRoot: Send {
    /// The aggregate's identity.
    fn aggregate_id(&self) -> AggregateId;

    /// The sequence number of the last committed event.
    fn version(&self) -> SequenceNumber;

    /// The sequence number of the last raised event, committed or not.
    fn last_sequence_number(&self) -> SequenceNumber;

    /// Events raised but not yet persisted, in raise order.
    fn uncommitted_events(&self) -> &[DomainEventMessage];

    /// Drains the uncommitted queue for persistence and advances the
    /// version to the last raised sequence.
    ///
    /// Only call this when the returned events are about to be persisted;
    /// a scope that fails afterwards discards the instance.
    fn take_uncommitted_events(&mut self) -> Vec<DomainEventMessage>;

    /// Whether the aggregate has been marked deleted.
    fn is_deleted(&self) -> bool;

    /// Installs the per-event registration callback, replacing any
    /// previously installed one.
    fn set_registration_callback(&mut self, callback: EventRegistrationCallback);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// An event-sourced aggregate instance: typed state plus the bookkeeping
/// the unit of work and the pipeline need (version, uncommitted queue,
/// deleted flag, registration callback).
pub struct EventSourcedAggregate<A: Aggregate> {
    aggregate_id: AggregateId,
    state: A,
    version: SequenceNumber,
    last_sequence: SequenceNumber,
    uncommitted: Vec<DomainEventMessage>,
    deleted: bool,
    registration_callback: Option<EventRegistrationCallback>,
}

impl<A: Aggregate> EventSourcedAggregate<A> {
    /// Creates a new aggregate with no history.
    pub fn new(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            state: A::default(),
            version: SequenceNumber::initial(),
            last_sequence: SequenceNumber::initial(),
            uncommitted: Vec::new(),
            deleted: false,
            registration_callback: None,
        }
    }

    /// Rebuilds an aggregate from its stored event history.
    ///
    /// The history must start at sequence 1 and be gap-free.
    pub fn from_history(
        aggregate_id: AggregateId,
        history: Vec<DomainEventMessage>,
    ) -> Result<Self, AggregateError> {
        let mut aggregate = Self::new(aggregate_id);
        let mut expected = SequenceNumber::first();
        for message in history {
            if message.sequence_number != expected {
                return Err(AggregateError::SequenceGap {
                    aggregate_id,
                    expected,
                    actual: message.sequence_number,
                });
            }
            let event: A::Event = serde_json::from_value(message.payload)?;
            aggregate.state.apply(event);
            aggregate.version = message.sequence_number;
            aggregate.last_sequence = message.sequence_number;
            expected = expected.next();
        }
        Ok(aggregate)
    }

    /// Returns the current state.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Raises a domain event: assigns the next sequence number, applies
    /// the event to the state and enqueues the envelope for persistence.
    pub fn raise(&mut self, event: A::Event) -> Result<(), serde_json::Error> {
        self.raise_with_metadata(event, MetaData::new())
    }

    /// Raises a domain event carrying the given metadata.
    pub fn raise_with_metadata(
        &mut self,
        event: A::Event,
        metadata: MetaData,
    ) -> Result<(), serde_json::Error> {
        let sequence = self.last_sequence.next();
        let mut message = DomainEventMessage::builder()
            .aggregate_id(self.aggregate_id)
            .sequence_number(sequence)
            .event_type(event.event_type())
            .payload(&event)?
            .metadata(metadata)
            .build();
        if let Some(callback) = self.registration_callback.as_mut() {
            message = callback(message);
        }
        self.state.apply(event);
        self.uncommitted.push(message);
        self.last_sequence = sequence;
        Ok(())
    }

    /// Marks the aggregate deleted. The pipeline evicts deleted aggregates
    /// from its cache after the scope commits.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }
}

impl<A: Aggregate> AggregateRoot for EventSourcedAggregate<A> {
    fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    fn version(&self) -> SequenceNumber {
        self.version
    }

    fn last_sequence_number(&self) -> SequenceNumber {
        self.last_sequence
    }

    fn uncommitted_events(&self) -> &[DomainEventMessage] {
        &self.uncommitted
    }

    fn take_uncommitted_events(&mut self) -> Vec<DomainEventMessage> {
        self.version = self.last_sequence;
        std::mem::take(&mut self.uncommitted)
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn set_registration_callback(&mut self, callback: EventRegistrationCallback) {
        self.registration_callback = Some(callback);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl<A: Aggregate + std::fmt::Debug> std::fmt::Debug for EventSourcedAggregate<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourcedAggregate")
            .field("aggregate_id", &self.aggregate_id)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("last_sequence", &self.last_sequence)
            .field("uncommitted", &self.uncommitted.len())
            .field("deleted", &self.deleted)
            .finish_non_exhaustive()
    }
}
