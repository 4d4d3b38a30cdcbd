//! Dispatch target seams and an in-process implementation.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use messaging::{EventMessage, EventPublisher, PublicationError};

use crate::error::ReplayError;

/// Error returned by an event listener.
pub type EventHandlingError = Box<dyn std::error::Error + Send + Sync>;

/// A consumer of published events.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Handles one published event.
    async fn on_event(&self, event: &EventMessage) -> Result<(), EventHandlingError>;

    /// Listeners that want replay lifecycle notifications return
    /// themselves here.
    fn as_replay_aware(&self) -> Option<&dyn ReplayAware> {
        None
    }
}

/// Lifecycle notifications around a replay window.
///
/// Listeners subscribed while a replay is running are handled best-effort:
/// they may see some replayed events without receiving `before_replay`.
pub trait ReplayAware: Send + Sync {
    /// A replay is about to start.
    fn before_replay(&self) {}

    /// The historical stream has been fully delivered and processed.
    fn after_replay(&self) {}

    /// The replay failed; its transaction has been rolled back.
    fn on_replay_failed(&self, _cause: &ReplayError) {}
}

/// Observer of downstream event processing.
pub trait EventProcessingMonitor: Send + Sync {
    /// The given batch finished processing successfully.
    fn on_event_processing_completed(&self, events: &[EventMessage]);

    /// The given batch failed processing.
    fn on_event_processing_failed(
        &self,
        events: &[EventMessage],
        cause: &(dyn std::error::Error + Send + Sync),
    );
}

/// A dispatch target: publication plus listener and monitor subscription.
pub trait EventBus: EventPublisher {
    /// Subscribes a listener to published events.
    fn subscribe(&self, listener: Arc<dyn EventListener>);

    /// Unsubscribes a previously subscribed listener.
    fn unsubscribe(&self, listener: &Arc<dyn EventListener>);

    /// Subscribes a processing monitor.
    fn subscribe_monitor(&self, monitor: Arc<dyn EventProcessingMonitor>);

    /// Unsubscribes a previously subscribed processing monitor.
    fn unsubscribe_monitor(&self, monitor: &Arc<dyn EventProcessingMonitor>);
}

/// In-process dispatch target: fans every published event out to all
/// subscribed listeners, then reports the batch to processing monitors.
#[derive(Default)]
pub struct SimpleEventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    monitors: RwLock<Vec<Arc<dyn EventProcessingMonitor>>>,
}

impl SimpleEventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscribed listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .expect("listener registry lock poisoned")
            .len()
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn EventListener>> {
        self.listeners
            .read()
            .expect("listener registry lock poisoned")
            .clone()
    }

    fn monitors_snapshot(&self) -> Vec<Arc<dyn EventProcessingMonitor>> {
        self.monitors
            .read()
            .expect("monitor registry lock poisoned")
            .clone()
    }
}

#[async_trait]
impl EventPublisher for SimpleEventBus {
    async fn publish(&self, events: Vec<EventMessage>) -> Result<(), PublicationError> {
        let listeners = self.listeners_snapshot();
        for event in &events {
            for listener in &listeners {
                if let Err(cause) = listener.on_event(event).await {
                    for monitor in &self.monitors_snapshot() {
                        monitor.on_event_processing_failed(&events, cause.as_ref());
                    }
                    return Err(PublicationError::new(cause.to_string()));
                }
            }
        }
        for monitor in &self.monitors_snapshot() {
            monitor.on_event_processing_completed(&events);
        }
        Ok(())
    }
}

impl EventBus for SimpleEventBus {
    fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .expect("listener registry lock poisoned")
            .push(listener);
    }

    fn unsubscribe(&self, listener: &Arc<dyn EventListener>) {
        self.listeners
            .write()
            .expect("listener registry lock poisoned")
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn subscribe_monitor(&self, monitor: Arc<dyn EventProcessingMonitor>) {
        self.monitors
            .write()
            .expect("monitor registry lock poisoned")
            .push(monitor);
    }

    fn unsubscribe_monitor(&self, monitor: &Arc<dyn EventProcessingMonitor>) {
        self.monitors
            .write()
            .expect("monitor registry lock poisoned")
            .retain(|m| !Arc::ptr_eq(m, monitor));
    }
}
