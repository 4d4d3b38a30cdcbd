//! Error types for unit-of-work scopes and transactions.

use thiserror::Error;

use common::{AggregateId, SequenceNumber};
use messaging::PublicationError;

use crate::transaction::TransactionHandle;

/// Error returned by listener hooks that may veto an operation.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned by a save callback.
pub type SaveError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while committing a unit of work.
///
/// Any of these converts the scope into a rollback; a commit is
/// all-or-nothing from the caller's point of view.
#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    /// The scope was not in the right status for the requested operation.
    #[error("unit of work is {actual}, expected {expected}")]
    IllegalState {
        expected: &'static str,
        actual: String,
    },

    /// A listener vetoed the commit during the prepare phase.
    #[error("commit vetoed by a listener: {0}")]
    Vetoed(#[source] ListenerError),

    /// An aggregate's save callback failed.
    #[error("failed to save aggregate {aggregate_id}: {source}")]
    SaveFailed {
        aggregate_id: AggregateId,
        #[source]
        source: SaveError,
    },

    /// The bound external transaction failed to commit.
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// A buffered event could not be delivered to its dispatch target.
    #[error("event delivery failed: {0}")]
    Delivery(#[from] PublicationError),
}

/// Errors raised by a transaction manager.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The handle does not identify an active transaction.
    #[error("unknown transaction handle {0}")]
    UnknownHandle(TransactionHandle),

    /// The underlying transactional resource failed.
    #[error("transaction failed: {0}")]
    Failed(String),
}

/// Errors raised while rebuilding an aggregate from its event history.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// The stored event stream is not gap-free.
    #[error(
        "event stream for aggregate {aggregate_id} has a gap: expected sequence {expected}, got {actual}"
    )]
    SequenceGap {
        aggregate_id: AggregateId,
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    /// An event payload could not be deserialized.
    #[error("failed to deserialize event payload: {0}")]
    Deserialization(#[from] serde_json::Error),
}
