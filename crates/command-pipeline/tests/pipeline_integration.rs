//! Integration tests for the command pipeline: ordering, failure triage,
//! and the blacklist/recovery protocol.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use command_pipeline::{CommandHandlerRegistry, CommandPipeline, PipelineError};
use common::{AggregateId, SequenceNumber};
use event_store::{AppendOptions, EventStore, InMemoryEventStore};
use messaging::{CommandMessage, DomainEventMessage, EventMessage, EventPublisher, PublicationError};
use unit_of_work::{Aggregate, AggregateRoot, DomainEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CounterEvent {
    Incremented { by: i64 },
}

impl DomainEvent for CounterEvent {
    fn event_type(&self) -> &'static str {
        "CounterIncremented"
    }
}

#[derive(Debug, Default)]
struct Counter {
    total: i64,
}

impl Aggregate for Counter {
    type Event = CounterEvent;

    fn aggregate_type() -> &'static str {
        "Counter"
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            CounterEvent::Incremented { by } => self.total += by,
        }
    }
}

#[derive(Clone, Default)]
struct CollectingPublisher {
    delivered: Arc<Mutex<Vec<EventMessage>>>,
}

impl CollectingPublisher {
    fn delivered(&self) -> Vec<EventMessage> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for CollectingPublisher {
    async fn publish(&self, events: Vec<EventMessage>) -> Result<(), PublicationError> {
        self.delivered.lock().unwrap().extend(events);
        Ok(())
    }
}

fn counter_registry() -> CommandHandlerRegistry<Counter> {
    let mut registry = CommandHandlerRegistry::new();
    registry.register("Increment", |_command, aggregate| {
        aggregate.raise(CounterEvent::Incremented { by: 1 })?;
        Ok(serde_json::json!(aggregate.last_sequence_number().as_u64()))
    });
    registry.register("IncrementTwice", |_command, aggregate| {
        aggregate.raise(CounterEvent::Incremented { by: 1 })?;
        aggregate.raise(CounterEvent::Incremented { by: 1 })?;
        Ok(serde_json::Value::Null)
    });
    registry.register("Reject", |_command, _aggregate| Err("rejected".into()));
    registry.register("RejectAfterRaising", |_command, aggregate| {
        aggregate.raise(CounterEvent::Incremented { by: 1 })?;
        Err("failed after raising".into())
    });
    registry
}

fn external_event(aggregate_id: AggregateId, sequence: u64) -> DomainEventMessage {
    DomainEventMessage::builder()
        .aggregate_id(aggregate_id)
        .sequence_number(SequenceNumber::new(sequence))
        .event_type("CounterIncremented")
        .payload_raw(serde_json::json!({"Incremented": {"by": 1}}))
        .build()
}

#[tokio::test]
async fn commands_from_concurrent_producers_apply_in_intake_order() {
    let store = InMemoryEventStore::new();
    let publisher = Arc::new(CollectingPublisher::default());
    let pipeline = Arc::new(
        CommandPipeline::<Counter>::builder(store.clone(), publisher)
            .registry(counter_registry())
            .build(),
    );
    let aggregate_id = AggregateId::new();

    let mut producers = Vec::new();
    for _ in 0..4 {
        let pipeline = Arc::clone(&pipeline);
        producers.push(tokio::spawn(async move {
            let mut results = Vec::new();
            for _ in 0..25 {
                let outcome = pipeline
                    .execute(aggregate_id, CommandMessage::new("Increment", serde_json::json!({})))
                    .await
                    .unwrap();
                results.push(outcome.as_u64().unwrap());
            }
            results
        }));
    }

    let mut sequences = Vec::new();
    for producer in producers {
        sequences.extend(producer.await.unwrap());
    }

    // Every application advanced the version by exactly one; taken
    // together the 100 commands produced sequences 1..=100 with no gaps.
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=100).collect::<Vec<u64>>());

    let events = store.read_events("Counter", aggregate_id).await.unwrap();
    assert_eq!(events.len(), 100);
    for (index, event) in events.iter().enumerate() {
        assert_eq!(event.sequence_number, SequenceNumber::new(index as u64 + 1));
    }
}

#[tokio::test]
async fn unknown_command_type_fails_with_no_handler() {
    let store = InMemoryEventStore::new();
    let publisher = Arc::new(CollectingPublisher::default());
    let pipeline = CommandPipeline::<Counter>::builder(store, publisher)
        .registry(counter_registry())
        .build();

    let result = pipeline
        .execute(
            AggregateId::new(),
            CommandMessage::new("Unknown", serde_json::json!({})),
        )
        .await;
    assert!(matches!(result, Err(PipelineError::NoHandler(_))));
}

#[tokio::test]
async fn committed_events_reach_the_publisher_in_order() {
    let store = InMemoryEventStore::new();
    let publisher = Arc::new(CollectingPublisher::default());
    let pipeline = CommandPipeline::<Counter>::builder(store, publisher.clone())
        .registry(counter_registry())
        .build();

    pipeline
        .execute(
            AggregateId::new(),
            CommandMessage::new("IncrementTwice", serde_json::json!({})),
        )
        .await
        .unwrap();

    let delivered = publisher.delivered();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|e| e.event_type == "CounterIncremented"));
}

#[tokio::test]
async fn handler_rejection_without_events_is_forwarded_verbatim() {
    let store = InMemoryEventStore::new();
    let publisher = Arc::new(CollectingPublisher::default());
    let pipeline = CommandPipeline::<Counter>::builder(store.clone(), publisher)
        .registry(counter_registry())
        .build();
    let aggregate_id = AggregateId::new();

    let result = pipeline
        .execute(aggregate_id, CommandMessage::new("Reject", serde_json::json!({})))
        .await;
    assert!(matches!(result, Err(PipelineError::Handler(_))));

    // The aggregate was not quarantined; the next command applies cleanly.
    let outcome = pipeline
        .execute(aggregate_id, CommandMessage::new("Increment", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(outcome.as_u64(), Some(1));
}

#[tokio::test]
async fn stale_cache_self_heals_through_blacklist_and_recovery() {
    let store = InMemoryEventStore::new();
    let publisher = Arc::new(CollectingPublisher::default());
    let pipeline = CommandPipeline::<Counter>::builder(store.clone(), publisher)
        .registry(counter_registry())
        .build();
    let aggregate_id = AggregateId::new();

    // Prime the cache with a committed aggregate at sequence 1.
    pipeline
        .execute(aggregate_id, CommandMessage::new("Increment", serde_json::json!({})))
        .await
        .unwrap();

    // Someone else appends behind the pipeline's back; the cached copy is
    // now stale.
    store
        .append_events(
            "Counter",
            vec![external_event(aggregate_id, 2)],
            AppendOptions::expect_sequence(SequenceNumber::new(1)),
        )
        .await
        .unwrap();

    // The next command conflicts on save, the aggregate is quarantined,
    // the silent retry hits the blacklist, and the caller receives the
    // underlying cause rather than the blacklist wrapper.
    let result = pipeline
        .execute(aggregate_id, CommandMessage::new("Increment", serde_json::json!({})))
        .await;
    match result {
        Err(PipelineError::UnitOfWork(_)) => {}
        other => panic!("expected the underlying save failure, got {other:?}"),
    }

    // The recovery entry evicted the stale copy: the next command reloads
    // from the store and continues at sequence 3.
    let outcome = pipeline
        .execute(aggregate_id, CommandMessage::new("Increment", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(outcome.as_u64(), Some(3));

    let events = store.read_events("Counter", aggregate_id).await.unwrap();
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn corrupt_state_surfaces_when_rescheduling_is_disabled() {
    let store = InMemoryEventStore::new();
    let publisher = Arc::new(CollectingPublisher::default());
    let pipeline = CommandPipeline::<Counter>::builder(store.clone(), publisher)
        .registry(counter_registry())
        .reschedule_on_corrupt_state(false)
        .build();
    let aggregate_id = AggregateId::new();

    // The handler raises an event, then fails: the cached copy mutated
    // without a matching persisted event.
    let result = pipeline
        .execute(
            aggregate_id,
            CommandMessage::new("RejectAfterRaising", serde_json::json!({})),
        )
        .await;
    assert!(matches!(
        result,
        Err(PipelineError::AggregateStateCorrupted { .. })
    ));

    // A follow-up command hits the blacklist; its caller receives the
    // underlying handler failure, and recovery is published.
    let result = pipeline
        .execute(aggregate_id, CommandMessage::new("Increment", serde_json::json!({})))
        .await;
    assert!(matches!(result, Err(PipelineError::Handler(_))));

    // After recovery the discarded mutation is gone: the aggregate starts
    // from an empty history and the first event carries sequence 1.
    let outcome = pipeline
        .execute(aggregate_id, CommandMessage::new("Increment", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(outcome.as_u64(), Some(1));
    assert_eq!(store.event_count().await, 1);
}

#[tokio::test]
async fn shutdown_drains_queued_commands() {
    let store = InMemoryEventStore::new();
    let publisher = Arc::new(CollectingPublisher::default());
    let pipeline = CommandPipeline::<Counter>::builder(store.clone(), publisher)
        .registry(counter_registry())
        .build();
    let aggregate_id = AggregateId::new();

    for _ in 0..10 {
        pipeline
            .dispatch(
                aggregate_id,
                CommandMessage::new("Increment", serde_json::json!({})),
                None,
            )
            .await
            .unwrap();
    }

    pipeline.shutdown().await;
    assert_eq!(store.event_count().await, 10);
}
