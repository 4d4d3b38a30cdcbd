use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{AggregateId, EventId, SequenceNumber};

use crate::metadata::MetaData;

/// An event envelope: a published fact with identity, payload and metadata.
///
/// The identity, payload and timestamp of a message never change once it
/// has been created; only metadata may be replaced, and doing so produces
/// a new message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The type of the event (e.g. "OrderCreated").
    pub event_type: String,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata about the event.
    pub metadata: MetaData,
}

impl EventMessage {
    /// Creates a new event message with a fresh identifier and the current time.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
            metadata: MetaData::new(),
        }
    }

    /// Returns a copy of this message carrying `metadata` instead of the
    /// current metadata. Identity, payload and timestamp are preserved.
    pub fn with_metadata(&self, metadata: MetaData) -> Self {
        Self {
            metadata,
            ..self.clone()
        }
    }

    /// Returns a copy of this message with `additional` merged into the
    /// current metadata.
    pub fn and_metadata(&self, additional: &MetaData) -> Self {
        self.with_metadata(self.metadata.merged_with(additional))
    }
}

/// An event raised by an aggregate, carrying the aggregate identifier and
/// the event's position in that aggregate's stream.
///
/// Invariant: sequence numbers for one aggregate identifier are gap-free
/// and strictly increasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEventMessage {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,

    /// The position of this event in the aggregate's stream.
    pub sequence_number: SequenceNumber,

    /// The type of the event.
    pub event_type: String,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata about the event.
    pub metadata: MetaData,
}

impl DomainEventMessage {
    /// Creates a new domain event message builder.
    pub fn builder() -> DomainEventMessageBuilder {
        DomainEventMessageBuilder::default()
    }

    /// Returns the plain event view of this domain event.
    ///
    /// The view shares the event identifier, so a replayed domain event
    /// and its live twin compare equal by identity.
    pub fn as_event_message(&self) -> EventMessage {
        EventMessage {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            timestamp: self.timestamp,
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Returns a copy of this message carrying `metadata` instead of the
    /// current metadata. Identity, payload, aggregate identifier and
    /// sequence number are preserved.
    pub fn with_metadata(&self, metadata: MetaData) -> Self {
        Self {
            metadata,
            ..self.clone()
        }
    }

    /// Returns a copy of this message with `additional` merged into the
    /// current metadata.
    pub fn and_metadata(&self, additional: &MetaData) -> Self {
        self.with_metadata(self.metadata.merged_with(additional))
    }
}

/// Builder for constructing domain event messages.
#[derive(Debug, Default)]
pub struct DomainEventMessageBuilder {
    event_id: Option<EventId>,
    aggregate_id: Option<AggregateId>,
    sequence_number: Option<SequenceNumber>,
    event_type: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    metadata: MetaData,
}

impl DomainEventMessageBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the aggregate ID.
    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    /// Sets the sequence number.
    pub fn sequence_number(mut self, sequence: SequenceNumber) -> Self {
        self.sequence_number = Some(sequence);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the metadata.
    pub fn metadata(mut self, metadata: MetaData) -> Self {
        self.metadata = metadata;
        self
    }

    /// Builds the domain event message.
    ///
    /// # Panics
    ///
    /// Panics if required fields (aggregate_id, sequence_number, event_type,
    /// payload) are not set.
    pub fn build(self) -> DomainEventMessage {
        DomainEventMessage {
            event_id: self.event_id.unwrap_or_default(),
            aggregate_id: self.aggregate_id.expect("aggregate_id is required"),
            sequence_number: self.sequence_number.expect("sequence_number is required"),
            event_type: self.event_type.expect("event_type is required"),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload.expect("payload is required"),
            metadata: self.metadata,
        }
    }

    /// Tries to build the message, returning None if required fields are missing.
    pub fn try_build(self) -> Option<DomainEventMessage> {
        Some(DomainEventMessage {
            event_id: self.event_id.unwrap_or_default(),
            aggregate_id: self.aggregate_id?,
            sequence_number: self.sequence_number?,
            event_type: self.event_type?,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload?,
            metadata: self.metadata,
        })
    }
}
