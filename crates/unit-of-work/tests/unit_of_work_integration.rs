//! Integration tests for the unit-of-work scope: commit and rollback
//! protocols, listener notifications, and event buffering.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::AggregateId;
use messaging::{EventMessage, EventPublisher, MetaData, PublicationError};
use unit_of_work::{
    Aggregate, AggregateRoot, DomainEvent, EventSourcedAggregate, ListenerError,
    RecordingTransactionManager, SaveAggregateCallback, TransactionManager, UnitOfWork,
    UnitOfWorkError, UnitOfWorkListener,
};

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

/// Publisher that records every delivered event.
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

/// Publisher that rejects every delivery.
struct FailingPublisher;

#[async_trait]
impl EventPublisher for FailingPublisher {
    async fn publish(&self, _events: Vec<EventMessage>) -> Result<(), PublicationError> {
        Err(PublicationError::new("target unavailable"))
    }
}

/// Save callback that records which aggregates were saved.
#[derive(Clone, Default)]
struct CountingSaveCallback {
    saved: Arc<Mutex<Vec<AggregateId>>>,
}

impl CountingSaveCallback {
    fn saved(&self) -> Vec<AggregateId> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl SaveAggregateCallback for CountingSaveCallback {
    async fn save(
        &self,
        aggregate: &mut dyn AggregateRoot,
    ) -> Result<(), unit_of_work::SaveError> {
        let _ = aggregate.take_uncommitted_events();
        self.saved.lock().unwrap().push(aggregate.aggregate_id());
        Ok(())
    }
}

/// Save callback that always fails.
struct FailingSaveCallback;

#[async_trait]
impl SaveAggregateCallback for FailingSaveCallback {
    async fn save(
        &self,
        _aggregate: &mut dyn AggregateRoot,
    ) -> Result<(), unit_of_work::SaveError> {
        Err("storage offline".into())
    }
}

/// Listener that logs every hook invocation.
#[derive(Clone, Default)]
struct RecordingListener {
    log: Arc<Mutex<Vec<String>>>,
    veto_commit: bool,
}

impl RecordingListener {
    fn vetoing() -> Self {
        Self {
            veto_commit: true,
            ..Self::default()
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl UnitOfWorkListener for RecordingListener {
    fn on_prepare_commit(
        &self,
        aggregates: &[&dyn AggregateRoot],
        events: &[EventMessage],
    ) -> Result<(), ListenerError> {
        self.log.lock().unwrap().push(format!(
            "prepare_commit({}, {})",
            aggregates.len(),
            events.len()
        ));
        if self.veto_commit {
            return Err("not today".into());
        }
        Ok(())
    }

    fn after_commit(&self, events: &[EventMessage]) {
        self.log
            .lock()
            .unwrap()
            .push(format!("after_commit({})", events.len()));
    }

    fn on_rollback(&self, cause: Option<&(dyn std::error::Error + Send + Sync)>) {
        self.log
            .lock()
            .unwrap()
            .push(format!("rollback(cause={})", cause.is_some()));
    }

    fn on_cleanup(&self) {
        self.log.lock().unwrap().push("cleanup".to_string());
    }
}

/// Listener that stamps every registered event's metadata.
struct StampingListener;

impl UnitOfWorkListener for StampingListener {
    fn on_event_registered(&self, event: &EventMessage) -> Option<MetaData> {
        Some(event.metadata.with_entry("stamped", serde_json::json!(true)))
    }
}

fn raise_on(root: &mut dyn AggregateRoot, by: i64) {
    root.as_any_mut()
        .downcast_mut::<EventSourcedAggregate<Counter>>()
        .unwrap()
        .raise(CounterEvent::Incremented { by })
        .unwrap();
}

#[tokio::test]
async fn commit_saves_every_aggregate_and_delivers_every_event_in_order() {
    let publisher = Arc::new(CollectingPublisher::default());
    let saves = Arc::new(CountingSaveCallback::default());
    let mut unit = UnitOfWork::started();

    let id_a = AggregateId::new();
    let id_b = AggregateId::new();

    let root_a = unit
        .register_aggregate(
            Box::new(EventSourcedAggregate::<Counter>::new(id_a)),
            publisher.clone(),
            saves.clone(),
        )
        .unwrap();
    raise_on(root_a, 1);

    unit.publish_event(
        EventMessage::new("Standalone", serde_json::json!({"n": 2})),
        publisher.clone(),
    )
    .unwrap();

    let root_b = unit
        .register_aggregate(
            Box::new(EventSourcedAggregate::<Counter>::new(id_b)),
            publisher.clone(),
            saves.clone(),
        )
        .unwrap();
    raise_on(root_b, 3);

    assert_eq!(unit.registered_aggregate_count(), 2);
    assert_eq!(unit.buffered_event_count(), 3);

    let aggregates = unit.commit().await.unwrap();

    // Exactly K saves, exactly M deliveries, in buffer order.
    assert_eq!(saves.saved(), vec![id_a, id_b]);
    let delivered = publisher.delivered();
    assert_eq!(delivered.len(), 3);
    assert_eq!(delivered[0].event_type, "CounterIncremented");
    assert_eq!(delivered[1].event_type, "Standalone");
    assert_eq!(delivered[2].event_type, "CounterIncremented");

    // Ownership of the registered aggregates comes back to the caller.
    assert_eq!(aggregates.len(), 2);
    assert_eq!(aggregates[0].aggregate_id(), id_a);
}

#[tokio::test]
async fn rollback_discards_saves_and_deliveries_and_always_cleans_up() {
    let publisher = Arc::new(CollectingPublisher::default());
    let saves = Arc::new(CountingSaveCallback::default());
    let listener = Arc::new(RecordingListener::default());

    let mut unit = UnitOfWork::started();
    unit.register_listener(listener.clone());
    let root = unit
        .register_aggregate(
            Box::new(EventSourcedAggregate::<Counter>::new(AggregateId::new())),
            publisher.clone(),
            saves.clone(),
        )
        .unwrap();
    raise_on(root, 1);

    unit.rollback(Some("caller aborted".into())).await;

    assert!(saves.saved().is_empty());
    assert!(publisher.delivered().is_empty());
    assert_eq!(
        listener.log(),
        vec!["rollback(cause=true)".to_string(), "cleanup".to_string()]
    );
}

#[tokio::test]
async fn prepare_commit_veto_forces_the_rollback_path() {
    let publisher = Arc::new(CollectingPublisher::default());
    let saves = Arc::new(CountingSaveCallback::default());
    let listener = Arc::new(RecordingListener::vetoing());

    let mut unit = UnitOfWork::started();
    unit.register_listener(listener.clone());
    let root = unit
        .register_aggregate(
            Box::new(EventSourcedAggregate::<Counter>::new(AggregateId::new())),
            publisher.clone(),
            saves.clone(),
        )
        .unwrap();
    raise_on(root, 1);

    let result = unit.commit().await;
    assert!(matches!(result, Err(UnitOfWorkError::Vetoed(_))));
    assert!(saves.saved().is_empty());
    assert!(publisher.delivered().is_empty());
    assert_eq!(
        listener.log(),
        vec![
            "prepare_commit(1, 1)".to_string(),
            "rollback(cause=true)".to_string(),
            "cleanup".to_string(),
        ]
    );
}

#[tokio::test]
async fn save_failure_aborts_commit_and_rolls_back() {
    let publisher = Arc::new(CollectingPublisher::default());
    let listener = Arc::new(RecordingListener::default());

    let mut unit = UnitOfWork::started();
    unit.register_listener(listener.clone());
    let root = unit
        .register_aggregate(
            Box::new(EventSourcedAggregate::<Counter>::new(AggregateId::new())),
            publisher.clone(),
            Arc::new(FailingSaveCallback),
        )
        .unwrap();
    raise_on(root, 1);

    let result = unit.commit().await;
    assert!(matches!(result, Err(UnitOfWorkError::SaveFailed { .. })));
    assert!(publisher.delivered().is_empty());
    let log = listener.log();
    assert!(log.contains(&"rollback(cause=true)".to_string()));
    assert!(log.contains(&"cleanup".to_string()));
}

#[tokio::test]
async fn delivery_failure_surfaces_and_runs_the_rollback_path() {
    let saves = Arc::new(CountingSaveCallback::default());
    let listener = Arc::new(RecordingListener::default());

    let mut unit = UnitOfWork::started();
    unit.register_listener(listener.clone());
    let root = unit
        .register_aggregate(
            Box::new(EventSourcedAggregate::<Counter>::new(AggregateId::new())),
            Arc::new(FailingPublisher),
            saves.clone(),
        )
        .unwrap();
    raise_on(root, 1);

    let result = unit.commit().await;
    assert!(matches!(result, Err(UnitOfWorkError::Delivery(_))));
    // The save had already happened when delivery failed.
    assert_eq!(saves.saved().len(), 1);
    assert!(listener.log().contains(&"cleanup".to_string()));
}

#[tokio::test]
async fn bound_transaction_commits_with_the_scope() {
    let manager = Arc::new(RecordingTransactionManager::new());
    let mut unit = UnitOfWork::started();
    unit.bind_transaction(manager.clone() as Arc<dyn TransactionManager>)
        .await
        .unwrap();

    unit.commit().await.unwrap();
    assert_eq!(manager.commit_count(), 1);
    assert_eq!(manager.rollback_count(), 0);
}

#[tokio::test]
async fn bound_transaction_rolls_back_with_the_scope() {
    let manager = Arc::new(RecordingTransactionManager::new());
    let mut unit = UnitOfWork::started();
    unit.bind_transaction(manager.clone() as Arc<dyn TransactionManager>)
        .await
        .unwrap();

    unit.rollback(None).await;
    assert_eq!(manager.commit_count(), 0);
    assert_eq!(manager.rollback_count(), 1);
}

#[tokio::test]
async fn duplicate_registration_returns_the_existing_instance() {
    let publisher = Arc::new(CollectingPublisher::default());
    let saves = Arc::new(CountingSaveCallback::default());
    let id = AggregateId::new();

    let mut unit = UnitOfWork::started();
    let root = unit
        .register_aggregate(
            Box::new(EventSourcedAggregate::<Counter>::new(id)),
            publisher.clone(),
            saves.clone(),
        )
        .unwrap();
    raise_on(root, 5);

    // Re-registering the same identifier is idempotent.
    let root_again = unit
        .register_aggregate(
            Box::new(EventSourcedAggregate::<Counter>::new(id)),
            publisher.clone(),
            saves.clone(),
        )
        .unwrap();
    let state = root_again
        .as_any()
        .downcast_ref::<EventSourcedAggregate<Counter>>()
        .unwrap()
        .state();
    assert_eq!(state.total, 5);
    assert_eq!(unit.registered_aggregate_count(), 1);

    unit.commit().await.unwrap();
    assert_eq!(saves.saved(), vec![id]);
}

#[tokio::test]
async fn registered_events_pass_through_the_listener_chain_before_buffering() {
    let publisher = Arc::new(CollectingPublisher::default());
    let saves = Arc::new(CountingSaveCallback::default());

    let mut unit = UnitOfWork::started();
    unit.register_listener(Arc::new(StampingListener));
    let root = unit
        .register_aggregate(
            Box::new(EventSourcedAggregate::<Counter>::new(AggregateId::new())),
            publisher.clone(),
            saves.clone(),
        )
        .unwrap();
    raise_on(root, 1);

    // The rewritten metadata is visible on the uncommitted event too, so
    // the persisted and the delivered copy agree.
    assert_eq!(
        root.uncommitted_events()[0].metadata.get("stamped"),
        Some(&serde_json::json!(true))
    );

    unit.commit().await.unwrap();
    let delivered = publisher.delivered();
    assert_eq!(
        delivered[0].metadata.get("stamped"),
        Some(&serde_json::json!(true))
    );
}
