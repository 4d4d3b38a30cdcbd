//! The bounded execution lane and its single worker.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use common::{AggregateId, SequenceNumber};
use event_store::{AppendOptions, EventStore};
use messaging::{CommandMessage, EventPublisher};
use unit_of_work::{
    Aggregate, AggregateRoot, EventSourcedAggregate, SaveAggregateCallback, SaveError, UnitOfWork,
};

use crate::callback::CommandCallback;
use crate::error::PipelineError;
use crate::registry::CommandHandlerRegistry;

/// One slot of the lane: either a command to execute or a recovery entry
/// evicting a quarantined aggregate.
enum PipelineEntry {
    Command {
        aggregate_id: AggregateId,
        command: CommandMessage,
        callback: Option<Arc<dyn CommandCallback>>,
    },
    Recover {
        aggregate_id: AggregateId,
    },
}

/// Builder for a [`CommandPipeline`].
pub struct CommandPipelineBuilder<A: Aggregate, S: EventStore> {
    store: S,
    publisher: Arc<dyn EventPublisher>,
    registry: CommandHandlerRegistry<A>,
    capacity: usize,
    reschedule_on_corrupt_state: bool,
}

impl<A: Aggregate, S: EventStore + 'static> CommandPipelineBuilder<A, S> {
    /// Sets the lane capacity (number of claimable slots). Default 1024.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Controls whether commands that failed against corrupted cached
    /// state are silently re-dispatched. Default true.
    pub fn reschedule_on_corrupt_state(mut self, reschedule: bool) -> Self {
        self.reschedule_on_corrupt_state = reschedule;
        self
    }

    /// Replaces the handler registry.
    pub fn registry(mut self, registry: CommandHandlerRegistry<A>) -> Self {
        self.registry = registry;
        self
    }

    /// Registers a single handler.
    pub fn register_handler<F>(mut self, command_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(
                &CommandMessage,
                &mut EventSourcedAggregate<A>,
            ) -> Result<serde_json::Value, crate::registry::CommandHandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.registry.register(command_type, handler);
        self
    }

    /// Spawns the worker task and returns the pipeline handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> CommandPipeline<A> {
        let (sender, receiver) = mpsc::channel(self.capacity.max(1));
        let store = Arc::new(self.store);
        let worker = PipelineWorker {
            save_callback: Arc::new(StoreSaveCallback {
                store: Arc::clone(&store),
                aggregate_type: A::aggregate_type(),
            }),
            store,
            publisher: self.publisher,
            registry: Arc::new(self.registry),
            cache: HashMap::new(),
            blacklist: HashMap::new(),
            requeue: sender.downgrade(),
            reschedule_on_corrupt_state: self.reschedule_on_corrupt_state,
        };
        let handle = tokio::spawn(worker.run(receiver));
        CommandPipeline {
            sender,
            worker: Some(handle),
            _aggregate: PhantomData,
        }
    }
}

/// Handle for dispatching commands into the lane.
///
/// Dispatch is non-blocking beyond claiming a slot; producers on arbitrary
/// tasks never contend on aggregates, only on lane capacity. Dropping the
/// handle (or calling [`shutdown`](Self::shutdown)) lets the worker drain
/// the queued entries and exit.
pub struct CommandPipeline<A: Aggregate> {
    sender: mpsc::Sender<PipelineEntry>,
    worker: Option<JoinHandle<()>>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> CommandPipeline<A> {
    /// Starts building a pipeline over `store`, delivering committed
    /// events to `publisher`.
    pub fn builder<S: EventStore + 'static>(
        store: S,
        publisher: Arc<dyn EventPublisher>,
    ) -> CommandPipelineBuilder<A, S> {
        CommandPipelineBuilder {
            store,
            publisher,
            registry: CommandHandlerRegistry::new(),
            capacity: 1024,
            reschedule_on_corrupt_state: true,
        }
    }

    /// Claims a slot and publishes `command` targeting `aggregate_id`.
    /// The callback, if any, is invoked exactly once with the outcome.
    pub async fn dispatch(
        &self,
        aggregate_id: AggregateId,
        command: CommandMessage,
        callback: Option<Arc<dyn CommandCallback>>,
    ) -> Result<(), PipelineError> {
        metrics::counter!("pipeline_commands_total").increment(1);
        match self.sender.reserve().await {
            Ok(permit) => {
                permit.send(PipelineEntry::Command {
                    aggregate_id,
                    command,
                    callback,
                });
                Ok(())
            }
            Err(_) => Err(PipelineError::Shutdown),
        }
    }

    /// Dispatches `command` and waits for its outcome.
    pub async fn execute(
        &self,
        aggregate_id: AggregateId,
        command: CommandMessage,
    ) -> Result<serde_json::Value, PipelineError> {
        let (callback, future) = crate::callback::FutureCallback::channel();
        self.dispatch(aggregate_id, command, Some(callback)).await?;
        future.outcome().await
    }

    /// Closes the lane, waits for the worker to drain queued entries and
    /// exit.
    pub async fn shutdown(self) {
        let CommandPipeline { sender, worker, .. } = self;
        drop(sender);
        if let Some(handle) = worker {
            let _ = handle.await;
        }
    }
}

/// Persists an aggregate's uncommitted events with an optimistic
/// expected-sequence check against the sequence the cached copy believes
/// it is at.
struct StoreSaveCallback<S: EventStore> {
    store: Arc<S>,
    aggregate_type: &'static str,
}

#[async_trait]
impl<S: EventStore> SaveAggregateCallback for StoreSaveCallback<S> {
    async fn save(&self, aggregate: &mut dyn AggregateRoot) -> Result<(), SaveError> {
        let expected = aggregate.version();
        let events = aggregate.take_uncommitted_events();
        if events.is_empty() {
            return Ok(());
        }
        let options = if expected == SequenceNumber::initial() {
            AppendOptions::expect_new()
        } else {
            AppendOptions::expect_sequence(expected)
        };
        self.store
            .append_events(self.aggregate_type, events, options)
            .await
            .map_err(|e| Box::new(e) as SaveError)?;
        Ok(())
    }
}

enum ExecutionFailure {
    /// The cached copy is dirty; quarantine the aggregate.
    Corrupted(PipelineError),
    /// Plain failure; the cached copy was not touched.
    Plain(PipelineError),
}

struct PipelineWorker<A: Aggregate, S: EventStore> {
    store: Arc<S>,
    publisher: Arc<dyn EventPublisher>,
    registry: Arc<CommandHandlerRegistry<A>>,
    save_callback: Arc<StoreSaveCallback<S>>,
    cache: HashMap<AggregateId, EventSourcedAggregate<A>>,
    blacklist: HashMap<AggregateId, Arc<PipelineError>>,
    requeue: mpsc::WeakSender<PipelineEntry>,
    reschedule_on_corrupt_state: bool,
}

impl<A: Aggregate, S: EventStore + 'static> PipelineWorker<A, S> {
    async fn run(mut self, mut receiver: mpsc::Receiver<PipelineEntry>) {
        while let Some(entry) = receiver.recv().await {
            match entry {
                PipelineEntry::Recover { aggregate_id } => self.recover(aggregate_id),
                PipelineEntry::Command {
                    aggregate_id,
                    command,
                    callback,
                } => {
                    self.handle_command(aggregate_id, command, callback).await;
                }
            }
        }
        tracing::debug!("command pipeline worker stopped");
    }

    /// Evicts the cached copy and lifts the blacklist. The next command
    /// against this aggregate reloads from durable storage.
    fn recover(&mut self, aggregate_id: AggregateId) {
        self.cache.remove(&aggregate_id);
        self.blacklist.remove(&aggregate_id);
        metrics::counter!("pipeline_recoveries_total").increment(1);
        tracing::info!(%aggregate_id, "evicted aggregate after recovery entry");
    }

    #[tracing::instrument(
        skip(self, command, callback),
        fields(command_type = %command.command_type, %aggregate_id)
    )]
    async fn handle_command(
        &mut self,
        aggregate_id: AggregateId,
        command: CommandMessage,
        callback: Option<Arc<dyn CommandCallback>>,
    ) {
        let started = std::time::Instant::now();
        let wrapped = RecoveringCallback {
            delegate: callback,
            aggregate_id,
            command: command.clone(),
            requeue: self.requeue.clone(),
            reschedule_on_corrupt_state: self.reschedule_on_corrupt_state,
        };

        if let Some(cause) = self.blacklist.get(&aggregate_id) {
            wrapped.on_failure(PipelineError::AggregateBlacklisted {
                aggregate_id,
                cause: Arc::clone(cause),
            });
            return;
        }

        match self.execute(aggregate_id, &command).await {
            Ok((result, aggregate)) => {
                if aggregate.is_deleted() {
                    self.cache.remove(&aggregate_id);
                } else {
                    self.cache.insert(aggregate_id, aggregate);
                }
                wrapped.on_success(result);
            }
            Err(ExecutionFailure::Corrupted(cause)) => {
                let cause = Arc::new(cause);
                self.blacklist.insert(aggregate_id, Arc::clone(&cause));
                metrics::counter!("pipeline_blacklists_total").increment(1);
                tracing::warn!(%aggregate_id, error = %cause, "aggregate blacklisted");
                wrapped.on_failure(PipelineError::AggregateStateCorrupted {
                    aggregate_id,
                    cause,
                });
            }
            Err(ExecutionFailure::Plain(cause)) => wrapped.on_failure(cause),
        }
        metrics::histogram!("pipeline_command_duration_seconds")
            .record(started.elapsed().as_secs_f64());
    }

    /// Executes one command inside a fresh unit of work. On success the
    /// committed aggregate comes back for the cache; failures say whether
    /// the cached copy is dirty.
    async fn execute(
        &mut self,
        aggregate_id: AggregateId,
        command: &CommandMessage,
    ) -> Result<(serde_json::Value, EventSourcedAggregate<A>), ExecutionFailure> {
        let handler = self
            .registry
            .resolve(&command.command_type)
            .map_err(ExecutionFailure::Plain)?;

        let aggregate = match self.cache.remove(&aggregate_id) {
            Some(cached) => cached,
            None => {
                let history = self
                    .store
                    .read_events(A::aggregate_type(), aggregate_id)
                    .await
                    .map_err(|e| ExecutionFailure::Plain(e.into()))?;
                if history.is_empty() {
                    EventSourcedAggregate::new(aggregate_id)
                } else {
                    EventSourcedAggregate::from_history(aggregate_id, history)
                        .map_err(|e| ExecutionFailure::Plain(e.into()))?
                }
            }
        };

        let mut scope = UnitOfWork::started();
        let root = match scope.register_aggregate(
            Box::new(aggregate),
            Arc::clone(&self.publisher),
            self.save_callback.clone() as Arc<dyn SaveAggregateCallback>,
        ) {
            Ok(root) => root,
            Err(error) => return Err(ExecutionFailure::Plain(error.into())),
        };
        let typed = match root.as_any_mut().downcast_mut::<EventSourcedAggregate<A>>() {
            Some(typed) => typed,
            None => {
                return Err(ExecutionFailure::Plain(PipelineError::Handler(
                    "registered aggregate has an unexpected type".to_string(),
                )));
            }
        };

        match handler(command, &mut *typed) {
            Ok(result) => match scope.commit().await {
                Ok(mut aggregates) => {
                    let Some(committed) = aggregates.pop() else {
                        return Err(ExecutionFailure::Plain(PipelineError::Handler(
                            "scope returned no aggregate".to_string(),
                        )));
                    };
                    match committed.into_any().downcast::<EventSourcedAggregate<A>>() {
                        Ok(aggregate) => Ok((result, *aggregate)),
                        Err(_) => Err(ExecutionFailure::Plain(PipelineError::Handler(
                            "scope returned an unexpected aggregate type".to_string(),
                        ))),
                    }
                }
                // The handler succeeded but persisting its events did not:
                // the cached copy now disagrees with the durable log.
                Err(error) => Err(ExecutionFailure::Corrupted(error.into())),
            },
            Err(handler_error) => {
                let dirty = !typed.uncommitted_events().is_empty();
                let error = PipelineError::Handler(handler_error.to_string());
                scope.rollback(Some(handler_error)).await;
                if dirty {
                    // Events were raised and applied but never persisted;
                    // the cached copy mutated without a matching event.
                    Err(ExecutionFailure::Corrupted(error))
                } else {
                    Err(ExecutionFailure::Plain(error))
                }
            }
        }
    }
}

/// Wraps the submitter's callback to triage failures before they reach it:
/// blacklisted aggregates trigger a recovery entry and the underlying
/// cause is forwarded; corrupt-state failures are silently re-dispatched
/// when enabled; everything else is forwarded verbatim.
struct RecoveringCallback {
    delegate: Option<Arc<dyn CommandCallback>>,
    aggregate_id: AggregateId,
    command: CommandMessage,
    requeue: mpsc::WeakSender<PipelineEntry>,
    reschedule_on_corrupt_state: bool,
}

impl RecoveringCallback {
    fn on_success(&self, result: serde_json::Value) {
        if let Some(delegate) = &self.delegate {
            delegate.on_success(result);
        }
    }

    fn on_failure(&self, cause: PipelineError) {
        match cause {
            PipelineError::AggregateBlacklisted {
                aggregate_id,
                cause,
            } => {
                requeue(&self.requeue, PipelineEntry::Recover { aggregate_id });
                if let Some(delegate) = &self.delegate {
                    delegate.on_failure((*cause).clone());
                } else {
                    tracing::warn!(
                        %aggregate_id,
                        error = %cause,
                        "blacklisted aggregate failure with no callback attached"
                    );
                }
            }
            PipelineError::AggregateStateCorrupted { aggregate_id, .. }
                if self.reschedule_on_corrupt_state =>
            {
                tracing::debug!(%aggregate_id, "re-dispatching command after corrupt state");
                requeue(
                    &self.requeue,
                    PipelineEntry::Command {
                        aggregate_id: self.aggregate_id,
                        command: self.command.clone(),
                        callback: self.delegate.clone(),
                    },
                );
            }
            other => {
                if let Some(delegate) = &self.delegate {
                    delegate.on_failure(other);
                } else {
                    tracing::warn!(
                        command_type = %self.command.command_type,
                        error = %other,
                        "command failed with no callback attached"
                    );
                }
            }
        }
    }
}

/// Re-enqueues an entry from within the worker without ever blocking the
/// worker on its own full lane.
fn requeue(sender: &mpsc::WeakSender<PipelineEntry>, entry: PipelineEntry) {
    let Some(sender) = sender.upgrade() else {
        notify_dropped(entry);
        return;
    };
    match sender.try_send(entry) {
        Ok(()) => {}
        Err(TrySendError::Full(entry)) => {
            tokio::spawn(async move {
                if let Err(error) = sender.send(entry).await {
                    notify_dropped(error.0);
                }
            });
        }
        Err(TrySendError::Closed(entry)) => notify_dropped(entry),
    }
}

fn notify_dropped(entry: PipelineEntry) {
    match entry {
        PipelineEntry::Command {
            command,
            callback: Some(callback),
            ..
        } => {
            tracing::warn!(
                command_type = %command.command_type,
                "pipeline closed; dropping re-dispatched command"
            );
            callback.on_failure(PipelineError::Shutdown);
        }
        PipelineEntry::Command { command, .. } => {
            tracing::warn!(
                command_type = %command.command_type,
                "pipeline closed; dropping re-dispatched command"
            );
        }
        PipelineEntry::Recover { aggregate_id } => {
            tracing::warn!(%aggregate_id, "pipeline closed; dropping recovery entry");
        }
    }
}
