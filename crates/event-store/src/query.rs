use chrono::{DateTime, Utc};

use common::AggregateId;
use messaging::DomainEventMessage;

/// Filter criteria for replay scanning.
///
/// Empty criteria match every event. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct EventCriteria {
    /// Restrict to one aggregate type.
    pub aggregate_type: Option<String>,

    /// Restrict to one aggregate instance.
    pub aggregate_id: Option<AggregateId>,

    /// Restrict to the named event types.
    pub event_types: Option<Vec<String>>,

    /// Only events created at or after this instant.
    pub from_timestamp: Option<DateTime<Utc>>,

    /// Only events created at or before this instant.
    pub to_timestamp: Option<DateTime<Utc>>,
}

impl EventCriteria {
    /// Creates criteria matching every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one aggregate type.
    pub fn with_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Restricts to one aggregate instance.
    pub fn with_aggregate_id(mut self, aggregate_id: AggregateId) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    /// Restricts to the named event types.
    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Only events created at or after `from`.
    pub fn with_from_timestamp(mut self, from: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(from);
        self
    }

    /// Only events created at or before `to`.
    pub fn with_to_timestamp(mut self, to: DateTime<Utc>) -> Self {
        self.to_timestamp = Some(to);
        self
    }

    /// Returns whether the given stored event matches these criteria.
    pub fn matches(&self, aggregate_type: &str, event: &DomainEventMessage) -> bool {
        if let Some(ref wanted) = self.aggregate_type
            && wanted != aggregate_type
        {
            return false;
        }
        if let Some(id) = self.aggregate_id
            && event.aggregate_id != id
        {
            return false;
        }
        if let Some(ref types) = self.event_types
            && !types.contains(&event.event_type)
        {
            return false;
        }
        if let Some(from) = self.from_timestamp
            && event.timestamp < from
        {
            return false;
        }
        if let Some(to) = self.to_timestamp
            && event.timestamp > to
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SequenceNumber;

    fn event(aggregate_id: AggregateId, event_type: &str) -> DomainEventMessage {
        DomainEventMessage::builder()
            .aggregate_id(aggregate_id)
            .sequence_number(SequenceNumber::first())
            .event_type(event_type)
            .payload_raw(serde_json::json!({}))
            .build()
    }

    #[test]
    fn empty_criteria_match_everything() {
        let criteria = EventCriteria::new();
        assert!(criteria.matches("Order", &event(AggregateId::new(), "OrderCreated")));
    }

    #[test]
    fn aggregate_type_filter() {
        let criteria = EventCriteria::new().with_aggregate_type("Order");
        let e = event(AggregateId::new(), "Created");
        assert!(criteria.matches("Order", &e));
        assert!(!criteria.matches("Customer", &e));
    }

    #[test]
    fn event_type_filter() {
        let criteria =
            EventCriteria::new().with_event_types(vec!["OrderCreated".to_string()]);
        assert!(criteria.matches("Order", &event(AggregateId::new(), "OrderCreated")));
        assert!(!criteria.matches("Order", &event(AggregateId::new(), "OrderShipped")));
    }

    #[test]
    fn aggregate_id_filter() {
        let id = AggregateId::new();
        let criteria = EventCriteria::new().with_aggregate_id(id);
        assert!(criteria.matches("Order", &event(id, "Created")));
        assert!(!criteria.matches("Order", &event(AggregateId::new(), "Created")));
    }
}
