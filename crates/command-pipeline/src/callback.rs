//! Command result callbacks.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::PipelineError;

/// Callback notified of a submitted command's outcome, exactly once.
pub trait CommandCallback: Send + Sync {
    /// The command was handled successfully.
    fn on_success(&self, result: serde_json::Value);

    /// The command failed.
    fn on_failure(&self, cause: PipelineError);
}

/// A callback backed by a oneshot channel, letting the submitter await
/// the outcome.
pub struct FutureCallback {
    sender: Mutex<Option<oneshot::Sender<Result<serde_json::Value, PipelineError>>>>,
}

impl FutureCallback {
    /// Creates a callback and the future resolving to the outcome it
    /// receives.
    pub fn channel() -> (Arc<Self>, CommandFuture) {
        let (sender, receiver) = oneshot::channel();
        (
            Arc::new(Self {
                sender: Mutex::new(Some(sender)),
            }),
            CommandFuture { receiver },
        )
    }

    fn complete(&self, outcome: Result<serde_json::Value, PipelineError>) {
        if let Some(sender) = self
            .sender
            .lock()
            .expect("callback sender lock poisoned")
            .take()
        {
            // The receiver may have been dropped; the outcome is then discarded.
            let _ = sender.send(outcome);
        }
    }
}

impl CommandCallback for FutureCallback {
    fn on_success(&self, result: serde_json::Value) {
        self.complete(Ok(result));
    }

    fn on_failure(&self, cause: PipelineError) {
        self.complete(Err(cause));
    }
}

/// The receiving side of a [`FutureCallback`].
pub struct CommandFuture {
    receiver: oneshot::Receiver<Result<serde_json::Value, PipelineError>>,
}

impl CommandFuture {
    /// Waits for the command's outcome. Resolves to
    /// [`PipelineError::Shutdown`] when the pipeline dropped the callback
    /// without invoking it.
    pub async fn outcome(self) -> Result<serde_json::Value, PipelineError> {
        self.receiver
            .await
            .unwrap_or(Err(PipelineError::Shutdown))
    }
}
