//! The replay coordinator: a dispatch target that can suspend live
//! delivery, replay a historical stream transactionally, and resynchronize.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::task::JoinHandle;

use event_store::{EventCriteria, EventStore};
use messaging::{EventMessage, EventPublisher, PublicationError};
use unit_of_work::{TransactionHandle, TransactionManager};

use crate::bus::{EventBus, EventListener, EventProcessingMonitor};
use crate::error::ReplayError;
use crate::monitor::CompletionMonitor;
use crate::incoming::IncomingMessageHandler;

/// How long the coordinator waits, after the historical stream is
/// exhausted, for downstream subscribers to finish the last replayed
/// event.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_millis(5000);

/// Replay status of a [`ReplayingEventBus`].
///
/// Transitions happen only in cyclic order:
/// Live -> Replaying -> ProcessingBacklog -> Live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplayStatus {
    /// Events are forwarded straight to the wrapped target.
    Live = 0,
    /// The historical stream is being replayed; live events are diverted
    /// to the incoming-message handler.
    Replaying = 1,
    /// The historical stream is done; buffered live traffic is flushing.
    ProcessingBacklog = 2,
}

#[derive(Debug)]
struct StatusCell(AtomicU8);

impl StatusCell {
    fn new() -> Self {
        Self(AtomicU8::new(ReplayStatus::Live as u8))
    }

    fn load(&self) -> ReplayStatus {
        match self.0.load(Ordering::SeqCst) {
            1 => ReplayStatus::Replaying,
            2 => ReplayStatus::ProcessingBacklog,
            _ => ReplayStatus::Live,
        }
    }

    fn set(&self, status: ReplayStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    fn begin_replay(&self) -> Result<(), ReplayError> {
        self.0
            .compare_exchange(
                ReplayStatus::Live as u8,
                ReplayStatus::Replaying as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(|_| ReplayError::AlreadyInProgress)
    }
}

/// Forwards processing-monitor notifications to external subscribers,
/// except while a replay is running: replayed traffic is internal and
/// must not look like live progress to the outside.
struct GatedMonitors {
    status: Arc<StatusCell>,
    delegates: RwLock<Vec<Arc<dyn EventProcessingMonitor>>>,
}

impl GatedMonitors {
    fn snapshot(&self) -> Vec<Arc<dyn EventProcessingMonitor>> {
        self.delegates
            .read()
            .expect("monitor registry lock poisoned")
            .clone()
    }

    fn add(&self, monitor: Arc<dyn EventProcessingMonitor>) {
        self.delegates
            .write()
            .expect("monitor registry lock poisoned")
            .push(monitor);
    }

    fn remove(&self, monitor: &Arc<dyn EventProcessingMonitor>) {
        self.delegates
            .write()
            .expect("monitor registry lock poisoned")
            .retain(|m| !Arc::ptr_eq(m, monitor));
    }
}

impl EventProcessingMonitor for GatedMonitors {
    fn on_event_processing_completed(&self, events: &[EventMessage]) {
        if self.status.load() != ReplayStatus::Replaying {
            for monitor in &self.snapshot() {
                monitor.on_event_processing_completed(events);
            }
        }
    }

    fn on_event_processing_failed(
        &self,
        events: &[EventMessage],
        cause: &(dyn std::error::Error + Send + Sync),
    ) {
        if self.status.load() != ReplayStatus::Replaying {
            for monitor in &self.snapshot() {
                monitor.on_event_processing_failed(events, cause);
            }
        }
    }
}

/// A dispatch target wrapping another [`EventBus`], adding the ability to
/// replay historical events from the store.
///
/// While live, every published event is forwarded to the wrapped target.
/// During a replay, live events go to the [`IncomingMessageHandler`]
/// instead; the handler reconciles them with the replayed stream before
/// live delivery resumes. The replay itself runs inside transactions from
/// the given manager, committing every `commit_threshold` events (0
/// disables intermediate commits).
pub struct ReplayingEventBus {
    delegate: Arc<dyn EventBus>,
    store: Arc<dyn EventStore>,
    transactions: Arc<dyn TransactionManager>,
    incoming: Arc<dyn IncomingMessageHandler>,
    commit_threshold: usize,
    completion_timeout: Duration,
    status: Arc<StatusCell>,
    gate: Arc<GatedMonitors>,
    replay_aware: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl ReplayingEventBus {
    /// Wraps `delegate`, replaying events from `store` inside transactions
    /// from `transactions`. `commit_threshold` is the number of replayed
    /// events per transaction (0 disables intermediate commits); live
    /// events during a replay go to `incoming`.
    pub fn new(
        delegate: Arc<dyn EventBus>,
        store: Arc<dyn EventStore>,
        transactions: Arc<dyn TransactionManager>,
        commit_threshold: usize,
        incoming: Arc<dyn IncomingMessageHandler>,
    ) -> Self {
        let status = Arc::new(StatusCell::new());
        let gate = Arc::new(GatedMonitors {
            status: Arc::clone(&status),
            delegates: RwLock::new(Vec::new()),
        });
        delegate.subscribe_monitor(Arc::clone(&gate) as Arc<dyn EventProcessingMonitor>);
        Self {
            delegate,
            store,
            transactions,
            incoming,
            commit_threshold,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            status,
            gate,
            replay_aware: RwLock::new(Vec::new()),
        }
    }

    /// Overrides the post-replay completion timeout.
    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    /// The coordinator's current status.
    pub fn status(&self) -> ReplayStatus {
        self.status.load()
    }

    /// Whether a replay is active (status is not Live).
    pub fn is_replaying(&self) -> bool {
        self.status.load() != ReplayStatus::Live
    }

    /// Runs a replay on the calling task, optionally restricted by
    /// `criteria`, and returns once it finished. Any failure rolls back
    /// the current transaction, notifies replay-aware listeners and the
    /// incoming-message handler, and resets the status to Live.
    #[tracing::instrument(skip(self, criteria))]
    pub async fn replay(&self, criteria: Option<EventCriteria>) -> Result<(), ReplayError> {
        self.incoming.prepare_for_replay(self.delegate.as_ref()).await;
        self.status.begin_replay()?;
        tracing::info!("entering replay mode");

        let monitor = Arc::new(CompletionMonitor::new());
        let monitor_dyn: Arc<dyn EventProcessingMonitor> = monitor.clone();
        self.delegate.subscribe_monitor(Arc::clone(&monitor_dyn));

        let result = self.run_replay(criteria, monitor.as_ref()).await;

        self.delegate.unsubscribe_monitor(&monitor_dyn);
        self.status.set(ReplayStatus::Live);
        tracing::info!("replay ended; back to live dispatch");
        result
    }

    /// Starts a replay on exactly one worker task and returns its handle.
    /// Use [`join_replay`] to await the handle with cancellation remapped
    /// to [`ReplayError::Interrupted`].
    pub fn spawn_replay(
        self: &Arc<Self>,
        criteria: Option<EventCriteria>,
    ) -> JoinHandle<Result<(), ReplayError>> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.replay(criteria).await })
    }

    async fn run_replay(
        &self,
        criteria: Option<EventCriteria>,
        monitor: &CompletionMonitor,
    ) -> Result<(), ReplayError> {
        let mut transaction = match self.transactions.start_transaction().await {
            Ok(handle) => handle,
            Err(error) => {
                let cause = replay_failure(error);
                self.notify_failure(&cause).await;
                return Err(cause);
            }
        };

        match self
            .replay_stream(criteria, monitor, &mut transaction)
            .await
        {
            Ok(()) => match self.transactions.commit_transaction(transaction).await {
                Ok(()) => Ok(()),
                Err(error) => {
                    let cause = replay_failure(error);
                    self.notify_failure(&cause).await;
                    Err(cause)
                }
            },
            Err(cause) => {
                self.notify_failure(&cause).await;
                if let Err(error) = self.transactions.rollback_transaction(transaction).await {
                    tracing::warn!(%error, "failed to roll back replay transaction");
                }
                Err(cause)
            }
        }
    }

    async fn replay_stream(
        &self,
        criteria: Option<EventCriteria>,
        monitor: &CompletionMonitor,
        transaction: &mut TransactionHandle,
    ) -> Result<(), ReplayError> {
        for listener in &self.replay_aware_snapshot() {
            if let Some(aware) = listener.as_replay_aware() {
                aware.before_replay();
            }
        }

        let mut stream = self
            .store
            .stream_events(criteria)
            .await
            .map_err(replay_failure)?;

        let mut since_commit = 0usize;
        let mut replayed = 0u64;
        let mut last_event = None;
        while let Some(item) = stream.next().await {
            let event = item.map_err(replay_failure)?;

            if self.commit_threshold > 0 && since_commit >= self.commit_threshold {
                self.transactions
                    .commit_transaction(*transaction)
                    .await
                    .map_err(replay_failure)?;
                *transaction = self
                    .transactions
                    .start_transaction()
                    .await
                    .map_err(replay_failure)?;
                since_commit = 0;
                metrics::counter!("replay_commits_total").increment(1);
                tracing::trace!("intermediate replay transaction committed");
            }

            self.delegate
                .publish(vec![event.as_event_message()])
                .await
                .map_err(replay_failure)?;
            let released = self
                .incoming
                .release_message(self.delegate.as_ref(), &event)
                .await;
            if !released.is_empty() {
                self.gate.on_event_processing_completed(&released);
            }

            last_event = Some(event.event_id);
            since_commit += 1;
            replayed += 1;
            metrics::counter!("replay_events_total").increment(1);
        }
        drop(stream);

        if let Some(last) = last_event {
            monitor.wait_for(last, self.completion_timeout).await;
        }

        for listener in &self.replay_aware_snapshot() {
            if let Some(aware) = listener.as_replay_aware() {
                aware.after_replay();
            }
        }

        self.status.set(ReplayStatus::ProcessingBacklog);
        tracing::debug!("processing backlog of live events");
        self.incoming
            .process_backlog(self.delegate.as_ref())
            .await
            .map_err(replay_failure)?;

        tracing::info!(events = replayed, "historical stream replayed");
        Ok(())
    }

    async fn notify_failure(&self, cause: &ReplayError) {
        self.incoming
            .on_replay_failed(self.delegate.as_ref(), cause)
            .await;
        for listener in &self.replay_aware_snapshot() {
            if let Some(aware) = listener.as_replay_aware() {
                aware.on_replay_failed(cause);
            }
        }
    }

    fn replay_aware_snapshot(&self) -> Vec<Arc<dyn EventListener>> {
        self.replay_aware
            .read()
            .expect("replay-aware registry lock poisoned")
            .clone()
    }
}

#[async_trait]
impl EventPublisher for ReplayingEventBus {
    async fn publish(&self, events: Vec<EventMessage>) -> Result<(), PublicationError> {
        if self.status.load() == ReplayStatus::Live {
            return self.delegate.publish(events).await;
        }
        tracing::debug!("replay active; diverting live events to the incoming handler");
        let acknowledged = self
            .incoming
            .on_incoming_messages(self.delegate.as_ref(), events)
            .await;
        if !acknowledged.is_empty() {
            self.gate.on_event_processing_completed(&acknowledged);
        }
        Ok(())
    }
}

impl EventBus for ReplayingEventBus {
    fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.delegate.subscribe(Arc::clone(&listener));
        if listener.as_replay_aware().is_some() {
            self.replay_aware
                .write()
                .expect("replay-aware registry lock poisoned")
                .push(listener);
        }
    }

    fn unsubscribe(&self, listener: &Arc<dyn EventListener>) {
        self.replay_aware
            .write()
            .expect("replay-aware registry lock poisoned")
            .retain(|l| !Arc::ptr_eq(l, listener));
        self.delegate.unsubscribe(listener);
    }

    fn subscribe_monitor(&self, monitor: Arc<dyn EventProcessingMonitor>) {
        self.gate.add(monitor);
    }

    fn unsubscribe_monitor(&self, monitor: &Arc<dyn EventProcessingMonitor>) {
        self.gate.remove(monitor);
    }
}

/// Awaits a replay task handle, remapping cancellation to
/// [`ReplayError::Interrupted`].
pub async fn join_replay(handle: JoinHandle<Result<(), ReplayError>>) -> Result<(), ReplayError> {
    match handle.await {
        Ok(result) => result,
        Err(join_error) if join_error.is_cancelled() => Err(ReplayError::Interrupted),
        Err(join_error) => Err(ReplayError::Failed(Box::new(join_error))),
    }
}

fn replay_failure<E>(error: E) -> ReplayError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ReplayError::Failed(Box::new(error))
}
