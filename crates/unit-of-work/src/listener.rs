//! Listener hooks observing a unit of work's lifecycle.

use messaging::{EventMessage, MetaData};

use crate::aggregate::AggregateRoot;
use crate::error::ListenerError;
use crate::transaction::TransactionHandle;

/// Hooks invoked at defined points of a scope's lifecycle.
///
/// Every hook has a no-op default, so implementations only override the
/// capabilities they need. Listeners are invoked in registration order.
pub trait UnitOfWorkListener: Send + Sync {
    /// Invoked when an event is registered with the scope, before it is
    /// buffered for delivery. May rewrite the event's metadata by returning
    /// a replacement; identity and payload cannot be changed.
    fn on_event_registered(&self, _event: &EventMessage) -> Option<MetaData> {
        None
    }

    /// Invoked at the start of commit with the registered aggregates and
    /// all buffered events. Returning an error vetoes the commit and
    /// forces the rollback path.
    fn on_prepare_commit(
        &self,
        _aggregates: &[&dyn AggregateRoot],
        _events: &[EventMessage],
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Invoked right before the bound external transaction commits.
    /// Only called for scopes bound to a transaction.
    fn on_prepare_transaction_commit(
        &self,
        _transaction: TransactionHandle,
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Invoked after a successful commit with the delivered events.
    fn after_commit(&self, _events: &[EventMessage]) {}

    /// Invoked when the scope rolls back, with the cause if one is known.
    fn on_rollback(&self, _cause: Option<&(dyn std::error::Error + Send + Sync)>) {}

    /// Invoked when the scope ends, after commit or rollback alike.
    /// Guaranteed to run exactly once per listener per scope.
    fn on_cleanup(&self) {}
}
