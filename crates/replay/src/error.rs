use thiserror::Error;

/// Errors raised by the replay coordinator.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// A replay is already running; status transitions are strictly
    /// Live -> Replaying -> ProcessingBacklog -> Live.
    #[error("a replay is already in progress")]
    AlreadyInProgress,

    /// The replay failed. The current transaction has been rolled back
    /// and replay-aware listeners have been notified.
    #[error("replay failed: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The replay task was cancelled before completion.
    #[error("replay was interrupted before completion")]
    Interrupted,
}
