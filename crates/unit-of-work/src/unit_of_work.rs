//! The unit-of-work scope itself.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use messaging::{EventMessage, EventPublisher};

use crate::aggregate::AggregateRoot;
use crate::error::{SaveError, UnitOfWorkError};
use crate::listener::UnitOfWorkListener;
use crate::transaction::{TransactionHandle, TransactionManager};

/// Lifecycle status of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkStatus {
    /// Created but not yet started.
    Idle,
    /// Open: aggregates and events can be registered.
    Started,
    /// Commit in progress.
    Committing,
    /// Rolled back; the scope is finished.
    RolledBack,
}

impl std::fmt::Display for UnitOfWorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnitOfWorkStatus::Idle => "idle",
            UnitOfWorkStatus::Started => "started",
            UnitOfWorkStatus::Committing => "committing",
            UnitOfWorkStatus::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

/// Callback used by a unit of work when it wishes to store an aggregate.
/// Abstracts the actual storage mechanism away from the scope itself.
#[async_trait]
pub trait SaveAggregateCallback: Send + Sync {
    /// Persists the aggregate's uncommitted events.
    async fn save(&self, aggregate: &mut dyn AggregateRoot) -> Result<(), SaveError>;
}

/// An event waiting in the delivery buffer, paired with its dispatch target.
struct PendingEvent {
    event: EventMessage,
    target: Arc<dyn EventPublisher>,
}

/// Delivery buffer shared with the registration callbacks installed on
/// registered aggregates. Confined to the scope's task; the lock is only
/// ever uncontended and never held across an await point.
#[derive(Clone, Default)]
struct EventBuffer {
    inner: Arc<Mutex<Vec<PendingEvent>>>,
}

impl EventBuffer {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingEvent>> {
        self.inner.lock().expect("event buffer lock poisoned")
    }

    fn push(&self, pending: PendingEvent) {
        self.lock().push(pending);
    }

    fn drain(&self) -> Vec<PendingEvent> {
        std::mem::take(&mut *self.lock())
    }

    fn snapshot_events(&self) -> Vec<EventMessage> {
        self.lock().iter().map(|p| p.event.clone()).collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

struct RegisteredAggregate {
    aggregate: Box<dyn AggregateRoot>,
    save_callback: Arc<dyn SaveAggregateCallback>,
}

struct ResourceEntry {
    value: Arc<dyn Any + Send + Sync>,
    inheritable: bool,
}

type ListenerList = Arc<Mutex<Vec<Arc<dyn UnitOfWorkListener>>>>;

/// A per-operation transactional scope.
///
/// Buffers aggregate registration and event publication until [`commit`]
/// runs the save callbacks and delivers the buffered events in order.
/// A scope is confined to one task for its entire lifetime.
///
/// [`commit`]: UnitOfWork::commit
pub struct UnitOfWork {
    status: UnitOfWorkStatus,
    listeners: ListenerList,
    resources: HashMap<String, ResourceEntry>,
    aggregates: Vec<RegisteredAggregate>,
    buffer: EventBuffer,
    transaction: Option<(Arc<dyn TransactionManager>, TransactionHandle)>,
}

impl UnitOfWork {
    /// Creates an idle scope. Call [`start`](Self::start) before use.
    pub fn new() -> Self {
        Self {
            status: UnitOfWorkStatus::Idle,
            listeners: Arc::new(Mutex::new(Vec::new())),
            resources: HashMap::new(),
            aggregates: Vec::new(),
            buffer: EventBuffer::default(),
            transaction: None,
        }
    }

    /// Creates a scope that is already started.
    pub fn started() -> Self {
        let mut unit = Self::new();
        unit.status = UnitOfWorkStatus::Started;
        unit
    }

    /// Opens the scope.
    pub fn start(&mut self) -> Result<(), UnitOfWorkError> {
        if self.status != UnitOfWorkStatus::Idle {
            return Err(UnitOfWorkError::IllegalState {
                expected: "idle",
                actual: self.status.to_string(),
            });
        }
        self.status = UnitOfWorkStatus::Started;
        Ok(())
    }

    /// Returns the scope's current status.
    pub fn status(&self) -> UnitOfWorkStatus {
        self.status
    }

    /// Starts a transaction with `manager` and binds it to this scope.
    /// The transaction commits as part of [`commit`](Self::commit) and
    /// rolls back with the scope.
    pub async fn bind_transaction(
        &mut self,
        manager: Arc<dyn TransactionManager>,
    ) -> Result<(), UnitOfWorkError> {
        self.ensure_started("bind_transaction")?;
        if self.transaction.is_some() {
            return Err(UnitOfWorkError::IllegalState {
                expected: "no bound transaction",
                actual: "transaction already bound".to_string(),
            });
        }
        let handle = manager.start_transaction().await?;
        self.transaction = Some((manager, handle));
        Ok(())
    }

    /// Registers a listener. Listeners are notified in registration order.
    pub fn register_listener(&mut self, listener: Arc<dyn UnitOfWorkListener>) {
        self.listeners
            .lock()
            .expect("listener registry lock poisoned")
            .push(listener);
    }

    /// Binds an aggregate to this scope for deferred persistence and
    /// returns the instance to use for the rest of the scope.
    ///
    /// Every event the aggregate raises from now on flows through the
    /// listeners' `on_event_registered` hook and into the delivery buffer,
    /// addressed to `target`.
    ///
    /// Registering an aggregate identifier that is already bound is
    /// idempotent: the existing instance is returned and the new instance
    /// and save callback are dropped.
    pub fn register_aggregate(
        &mut self,
        mut aggregate: Box<dyn AggregateRoot>,
        target: Arc<dyn EventPublisher>,
        save_callback: Arc<dyn SaveAggregateCallback>,
    ) -> Result<&mut dyn AggregateRoot, UnitOfWorkError> {
        self.ensure_started("register_aggregate")?;

        let aggregate_id = aggregate.aggregate_id();
        if let Some(position) = self
            .aggregates
            .iter()
            .position(|r| r.aggregate.aggregate_id() == aggregate_id)
        {
            tracing::debug!(%aggregate_id, "aggregate already registered with this scope");
            return Ok(self.aggregates[position].aggregate.as_mut());
        }

        let listeners = Arc::clone(&self.listeners);
        let buffer = self.buffer.clone();
        let callback_target = Arc::clone(&target);
        aggregate.set_registration_callback(Box::new(move |mut message| {
            let snapshot: Vec<Arc<dyn UnitOfWorkListener>> = listeners
                .lock()
                .expect("listener registry lock poisoned")
                .clone();
            for listener in &snapshot {
                let view = message.as_event_message();
                if let Some(metadata) = listener.on_event_registered(&view) {
                    message = message.with_metadata(metadata);
                }
            }
            buffer.push(PendingEvent {
                event: message.as_event_message(),
                target: Arc::clone(&callback_target),
            });
            message
        }));

        self.aggregates.push(RegisteredAggregate {
            aggregate,
            save_callback,
        });
        let last = self.aggregates.len() - 1;
        Ok(self.aggregates[last].aggregate.as_mut())
    }

    /// Buffers an event for delivery to `target` at commit. The listeners'
    /// `on_event_registered` hook applies before buffering; buffer order is
    /// preserved at delivery.
    pub fn publish_event(
        &mut self,
        event: EventMessage,
        target: Arc<dyn EventPublisher>,
    ) -> Result<(), UnitOfWorkError> {
        self.ensure_started("publish_event")?;
        let mut event = event;
        for listener in &self.listeners_snapshot() {
            if let Some(metadata) = listener.on_event_registered(&event) {
                event = event.with_metadata(metadata);
            }
        }
        self.buffer.push(PendingEvent { event, target });
        Ok(())
    }

    /// Attaches a scope-local resource under `key`. The resource is not
    /// visible to nested scopes.
    pub fn attach_resource<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.resources.insert(
            key.into(),
            ResourceEntry {
                value: Arc::new(value),
                inheritable: false,
            },
        );
    }

    /// Attaches a scope-local resource that nested scopes inherit.
    pub fn attach_inheritable_resource<T: Any + Send + Sync>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) {
        self.resources.insert(
            key.into(),
            ResourceEntry {
                value: Arc::new(value),
                inheritable: true,
            },
        );
    }

    /// Returns the resource stored under `key`, if present and of type `T`.
    pub fn resource<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.resources
            .get(key)
            .and_then(|entry| Arc::clone(&entry.value).downcast::<T>().ok())
    }

    /// Copies the parent's inheritable resources into this scope.
    pub(crate) fn inherit_resources_from(&mut self, parent: &UnitOfWork) {
        for (key, entry) in &parent.resources {
            if entry.inheritable {
                self.resources.insert(
                    key.clone(),
                    ResourceEntry {
                        value: Arc::clone(&entry.value),
                        inheritable: true,
                    },
                );
            }
        }
    }

    /// Number of aggregates registered with this scope.
    pub fn registered_aggregate_count(&self) -> usize {
        self.aggregates.len()
    }

    /// Number of events currently buffered for delivery.
    pub fn buffered_event_count(&self) -> usize {
        self.buffer.len()
    }

    /// Commits the scope. In order: prepare-commit listeners (veto point),
    /// save callbacks, bound transaction commit, event delivery in buffer
    /// order, after-commit and cleanup listeners. Any failure up to and
    /// including delivery aborts the remaining steps and runs the rollback
    /// path instead.
    ///
    /// On success, ownership of the registered aggregates returns to the
    /// caller.
    pub async fn commit(mut self) -> Result<Vec<Box<dyn AggregateRoot>>, UnitOfWorkError> {
        if self.status != UnitOfWorkStatus::Started {
            return Err(UnitOfWorkError::IllegalState {
                expected: "started",
                actual: self.status.to_string(),
            });
        }
        self.status = UnitOfWorkStatus::Committing;
        let listeners = self.listeners_snapshot();

        // Prepare commit: late validation and veto.
        let prepared = {
            let events = self.buffer.snapshot_events();
            let aggregates: Vec<&dyn AggregateRoot> = self
                .aggregates
                .iter()
                .map(|r| r.aggregate.as_ref())
                .collect();
            listeners
                .iter()
                .try_for_each(|l| l.on_prepare_commit(&aggregates, &events))
        };
        if let Err(cause) = prepared {
            return Err(self.rolled_back(UnitOfWorkError::Vetoed(cause)).await);
        }

        // Save every registered aggregate, in registration order.
        for index in 0..self.aggregates.len() {
            let entry = &mut self.aggregates[index];
            let aggregate_id = entry.aggregate.aggregate_id();
            let callback = Arc::clone(&entry.save_callback);
            if let Err(source) = callback.save(entry.aggregate.as_mut()).await {
                let error = UnitOfWorkError::SaveFailed {
                    aggregate_id,
                    source,
                };
                return Err(self.rolled_back(error).await);
            }
        }

        // Commit the bound external transaction, if any.
        if let Some((manager, handle)) = self.transaction.take() {
            let prepared = listeners
                .iter()
                .try_for_each(|l| l.on_prepare_transaction_commit(handle));
            if let Err(cause) = prepared {
                self.transaction = Some((manager, handle));
                return Err(self.rolled_back(UnitOfWorkError::Vetoed(cause)).await);
            }
            if let Err(error) = manager.commit_transaction(handle).await {
                return Err(self.rolled_back(UnitOfWorkError::Transaction(error)).await);
            }
        }

        // Deliver buffered events, in buffer order.
        let pending = self.buffer.drain();
        let mut delivered = Vec::with_capacity(pending.len());
        for p in pending {
            if let Err(error) = p.target.publish(vec![p.event.clone()]).await {
                return Err(self.rolled_back(UnitOfWorkError::Delivery(error)).await);
            }
            delivered.push(p.event);
        }

        for listener in &listeners {
            listener.after_commit(&delivered);
        }
        for listener in &listeners {
            listener.on_cleanup();
        }

        tracing::debug!(
            aggregates = self.aggregates.len(),
            events = delivered.len(),
            "unit of work committed"
        );

        Ok(self.aggregates.drain(..).map(|r| r.aggregate).collect())
    }

    /// Rolls the scope back: discards buffered events and aggregate
    /// registrations, rolls back a bound transaction, and notifies
    /// listeners: `on_rollback`, then `on_cleanup`; cleanup always runs.
    pub async fn rollback(mut self, cause: Option<Box<dyn std::error::Error + Send + Sync>>) {
        if !matches!(
            self.status,
            UnitOfWorkStatus::Started | UnitOfWorkStatus::Committing
        ) {
            return;
        }
        self.discard().await;
        let listeners = self.listeners_snapshot();
        let cause_ref = cause.as_deref();
        for listener in &listeners {
            listener.on_rollback(cause_ref);
        }
        for listener in &listeners {
            listener.on_cleanup();
        }
        self.status = UnitOfWorkStatus::RolledBack;
        tracing::debug!("unit of work rolled back");
    }

    /// Internal rollback path for commit failures. Returns the error so
    /// the caller can surface it after the scope is detached.
    async fn rolled_back(mut self, cause: UnitOfWorkError) -> UnitOfWorkError {
        self.discard().await;
        let listeners = self.listeners_snapshot();
        let cause_dyn: &(dyn std::error::Error + Send + Sync) = &cause;
        for listener in &listeners {
            listener.on_rollback(Some(cause_dyn));
        }
        for listener in &listeners {
            listener.on_cleanup();
        }
        self.status = UnitOfWorkStatus::RolledBack;
        tracing::debug!(error = %cause, "unit of work rolled back after commit failure");
        cause
    }

    async fn discard(&mut self) {
        self.buffer.clear();
        self.aggregates.clear();
        if let Some((manager, handle)) = self.transaction.take() {
            if let Err(error) = manager.rollback_transaction(handle).await {
                tracing::warn!(%error, "transaction rollback failed");
            }
        }
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn UnitOfWorkListener>> {
        self.listeners
            .lock()
            .expect("listener registry lock poisoned")
            .clone()
    }

    fn ensure_started(&self, operation: &'static str) -> Result<(), UnitOfWorkError> {
        if self.status != UnitOfWorkStatus::Started {
            return Err(UnitOfWorkError::IllegalState {
                expected: operation,
                actual: self.status.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}
