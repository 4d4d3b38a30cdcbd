//! Completion barrier for the final replayed event.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use common::EventId;
use messaging::EventMessage;

use crate::bus::EventProcessingMonitor;

#[derive(Debug, Default)]
struct CompletionState {
    awaited: Option<EventId>,
    last_processed: Option<EventId>,
}

/// Monitors downstream processing and lets the replay worker wait until
/// the last replayed event has been fully processed, bounded by a timeout.
///
/// Failed processing counts as processed: the barrier only answers "are
/// the subscribers done", not "did they succeed".
#[derive(Debug, Default)]
pub(crate) struct CompletionMonitor {
    state: Mutex<CompletionState>,
    notify: Notify,
}

impl CompletionMonitor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Blocks the calling task until the event identified by `last` has
    /// been processed, or until `timeout` elapses. A timeout is tolerated
    /// and logged; the replay proceeds regardless.
    pub(crate) async fn wait_for(&self, last: EventId, timeout: Duration) {
        let notified = self.notify.notified();
        {
            let mut state = self.state.lock().expect("completion monitor lock poisoned");
            state.awaited = Some(last);
            if state.last_processed == Some(last) {
                return;
            }
        }
        if tokio::time::timeout(timeout, notified).await.is_err() {
            tracing::warn!(
                ?timeout,
                "timed out waiting for downstream processing of the final replayed event"
            );
        }
    }

    fn record(&self, events: &[EventMessage]) {
        let Some(last) = events.last() else {
            return;
        };
        let mut state = self.state.lock().expect("completion monitor lock poisoned");
        state.last_processed = Some(last.event_id);
        if state.awaited == state.last_processed {
            self.notify.notify_one();
        }
    }
}

impl EventProcessingMonitor for CompletionMonitor {
    fn on_event_processing_completed(&self, events: &[EventMessage]) {
        self.record(events);
    }

    fn on_event_processing_failed(
        &self,
        events: &[EventMessage],
        _cause: &(dyn std::error::Error + Send + Sync),
    ) {
        self.record(events);
    }
}
