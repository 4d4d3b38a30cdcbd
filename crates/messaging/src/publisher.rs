use async_trait::async_trait;
use thiserror::Error;

use crate::event::EventMessage;

/// Error raised when delivering events to a dispatch target fails.
#[derive(Debug, Clone, Error)]
#[error("event publication failed: {reason}")]
pub struct PublicationError {
    /// Human-readable description of the failure.
    pub reason: String,
}

impl PublicationError {
    /// Creates a publication error from a reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A dispatch target for committed events.
///
/// The unit of work buffers events during command execution and delivers
/// them through this seam, in buffer order, once the scope commits.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Delivers the given events to this target.
    async fn publish(&self, events: Vec<EventMessage>) -> Result<(), PublicationError>;
}
