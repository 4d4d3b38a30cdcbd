//! Handling of live events arriving while a replay is active.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use messaging::{DomainEventMessage, EventMessage, PublicationError};

use crate::bus::EventBus;
use crate::error::ReplayError;

/// Decides what happens to live events presented while a replay is
/// running: buffer them, merge them with the historical stream, or drop
/// them.
#[async_trait]
pub trait IncomingMessageHandler: Send + Sync {
    /// A replay is about to start.
    async fn prepare_for_replay(&self, delegate: &dyn EventBus);

    /// Live events arrived while the replay is active. Returns the events
    /// this handler considers fully handled ("acknowledged"); those are
    /// reported to processing monitors and will not be delivered later.
    async fn on_incoming_messages(
        &self,
        delegate: &dyn EventBus,
        events: Vec<EventMessage>,
    ) -> Vec<EventMessage>;

    /// A historical event was just republished. The handler may release
    /// buffered live duplicates of it; released messages are reported as
    /// processed and will not be delivered again.
    async fn release_message(
        &self,
        delegate: &dyn EventBus,
        event: &DomainEventMessage,
    ) -> Vec<EventMessage>;

    /// The historical stream is done; flush buffered live traffic through
    /// the delegate.
    async fn process_backlog(&self, delegate: &dyn EventBus) -> Result<(), PublicationError>;

    /// The replay failed and its transaction was rolled back.
    async fn on_replay_failed(&self, delegate: &dyn EventBus, cause: &ReplayError);
}

/// Buffers live events during a replay and merges duplicates by event
/// identity: a buffered live event whose identifier matches a replayed
/// historical event is released instead of delivered twice.
#[derive(Debug, Default)]
pub struct BackloggingIncomingMessageHandler {
    backlog: Mutex<VecDeque<EventMessage>>,
}

impl BackloggingIncomingMessageHandler {
    /// Creates a handler with an empty backlog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently buffered live events.
    pub fn backlog_len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<EventMessage>> {
        self.backlog.lock().expect("backlog lock poisoned")
    }
}

#[async_trait]
impl IncomingMessageHandler for BackloggingIncomingMessageHandler {
    async fn prepare_for_replay(&self, _delegate: &dyn EventBus) {
        // The backlog is drained at the end of every replay cycle, failed
        // or not, so there is nothing to reset here.
        tracing::debug!("backlogging live events for the upcoming replay");
    }

    async fn on_incoming_messages(
        &self,
        _delegate: &dyn EventBus,
        events: Vec<EventMessage>,
    ) -> Vec<EventMessage> {
        tracing::debug!(count = events.len(), "backlogging live events during replay");
        self.lock().extend(events);
        Vec::new()
    }

    async fn release_message(
        &self,
        _delegate: &dyn EventBus,
        event: &DomainEventMessage,
    ) -> Vec<EventMessage> {
        let mut backlog = self.lock();
        let mut released = Vec::new();
        let mut index = 0;
        while index < backlog.len() {
            if backlog[index].event_id == event.event_id {
                if let Some(message) = backlog.remove(index) {
                    released.push(message);
                }
            } else {
                index += 1;
            }
        }
        released
    }

    async fn process_backlog(&self, delegate: &dyn EventBus) -> Result<(), PublicationError> {
        let drained: Vec<EventMessage> = self.lock().drain(..).collect();
        if drained.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = drained.len(), "flushing backlogged live events");
        delegate.publish(drained).await
    }

    async fn on_replay_failed(&self, delegate: &dyn EventBus, cause: &ReplayError) {
        // The replayed deliveries were rolled back, but these live events
        // were acknowledged to their producers; forward them rather than
        // dropping them.
        let drained: Vec<EventMessage> = self.lock().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        tracing::error!(
            error = %cause,
            count = drained.len(),
            "replay failed; forwarding backlogged live events"
        );
        if let Err(error) = delegate.publish(drained).await {
            tracing::error!(%error, "failed to forward backlogged events after replay failure");
        }
    }
}

/// Drops live events during a replay. For consumers that treat the
/// historical stream as authoritative and can afford to miss live
/// traffic inside the replay window.
#[derive(Debug, Default)]
pub struct DiscardingIncomingMessageHandler;

impl DiscardingIncomingMessageHandler {
    /// Creates the handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IncomingMessageHandler for DiscardingIncomingMessageHandler {
    async fn prepare_for_replay(&self, _delegate: &dyn EventBus) {}

    async fn on_incoming_messages(
        &self,
        _delegate: &dyn EventBus,
        events: Vec<EventMessage>,
    ) -> Vec<EventMessage> {
        tracing::debug!(count = events.len(), "discarding live events during replay");
        events
    }

    async fn release_message(
        &self,
        _delegate: &dyn EventBus,
        _event: &DomainEventMessage,
    ) -> Vec<EventMessage> {
        Vec::new()
    }

    async fn process_backlog(&self, _delegate: &dyn EventBus) -> Result<(), PublicationError> {
        Ok(())
    }

    async fn on_replay_failed(&self, _delegate: &dyn EventBus, _cause: &ReplayError) {}
}
