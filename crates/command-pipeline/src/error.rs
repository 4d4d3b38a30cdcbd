use std::sync::Arc;

use thiserror::Error;

use common::AggregateId;
use event_store::EventStoreError;
use unit_of_work::{AggregateError, UnitOfWorkError};

/// Errors surfaced by the command pipeline.
///
/// The enum is cloneable because the same failure can reach several
/// places: the blacklist record, the caller's callback, and the log.
/// Underlying errors are therefore shared behind `Arc`.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// No handler is registered for the command's type key.
    #[error("no handler registered for command type `{0}`")]
    NoHandler(String),

    /// The target aggregate is quarantined pending recovery. Carries the
    /// corruption that caused the quarantine.
    #[error("aggregate {aggregate_id} is blacklisted pending recovery: {cause}")]
    AggregateBlacklisted {
        aggregate_id: AggregateId,
        cause: Arc<PipelineError>,
    },

    /// The cached copy of the target aggregate diverged from the durable
    /// log. The pipeline may retry the command automatically.
    #[error("cached state for aggregate {aggregate_id} is corrupted: {cause}")]
    AggregateStateCorrupted {
        aggregate_id: AggregateId,
        cause: Arc<PipelineError>,
    },

    /// The command handler rejected the command.
    #[error("command handler failed: {0}")]
    Handler(String),

    /// The event store reported an error.
    #[error("event store error: {0}")]
    Store(Arc<EventStoreError>),

    /// Committing or rolling back the command's scope failed.
    #[error("unit of work error: {0}")]
    UnitOfWork(Arc<UnitOfWorkError>),

    /// The aggregate's stored history could not be restored.
    #[error("aggregate history could not be restored: {0}")]
    History(Arc<AggregateError>),

    /// The pipeline has been shut down.
    #[error("command pipeline is shut down")]
    Shutdown,
}

impl From<EventStoreError> for PipelineError {
    fn from(error: EventStoreError) -> Self {
        Self::Store(Arc::new(error))
    }
}

impl From<UnitOfWorkError> for PipelineError {
    fn from(error: UnitOfWorkError) -> Self {
        Self::UnitOfWork(Arc::new(error))
    }
}

impl From<AggregateError> for PipelineError {
    fn from(error: AggregateError) -> Self {
        Self::History(Arc::new(error))
    }
}
