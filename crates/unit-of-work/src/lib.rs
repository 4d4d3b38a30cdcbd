//! Per-operation transactional scope for event-sourced aggregates.
//!
//! A [`UnitOfWork`] buffers aggregate registration and event publication
//! until commit: save callbacks and event delivery only run once the scope
//! commits, and a rollback discards both. Nested scopes form an explicit
//! stack owned by the caller's task ([`UnitOfWorkContext`]); there is no
//! ambient "current" scope.
//!
//! The crate also provides the aggregate model ([`Aggregate`],
//! [`EventSourcedAggregate`], [`AggregateRoot`]) and the transaction
//! manager seam used by scopes bound to an external transaction.

pub mod aggregate;
pub mod context;
pub mod error;
pub mod listener;
pub mod transaction;
pub mod unit_of_work;

pub use aggregate::{
    Aggregate, AggregateRoot, DomainEvent, EventRegistrationCallback, EventSourcedAggregate,
};
pub use context::UnitOfWorkContext;
pub use error::{AggregateError, ListenerError, SaveError, TransactionError, UnitOfWorkError};
pub use listener::UnitOfWorkListener;
pub use transaction::{
    NoTransactionManager, RecordingTransactionManager, TransactionHandle, TransactionManager,
};
pub use unit_of_work::{SaveAggregateCallback, UnitOfWork, UnitOfWorkStatus};
