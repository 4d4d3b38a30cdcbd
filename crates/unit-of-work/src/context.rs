//! Explicit per-task stack of unit-of-work scopes.

use std::sync::Arc;

use crate::aggregate::AggregateRoot;
use crate::error::UnitOfWorkError;
use crate::transaction::TransactionManager;
use crate::unit_of_work::UnitOfWork;

/// The stack of scopes owned by one logical task.
///
/// There is no ambient "current unit of work": callers hold a context and
/// pass it through call boundaries. `start` opens a scope; a nested `start`
/// opens a child that inherits the parent's inheritable resources. A
/// context must never be shared or handed across tasks.
#[derive(Default)]
pub struct UnitOfWorkContext {
    stack: Vec<UnitOfWork>,
}

impl UnitOfWorkContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a scope. If a scope is already active, the new scope becomes
    /// its child and inherits the resources flagged inheritable.
    pub fn start(&mut self) -> &mut UnitOfWork {
        let mut unit = UnitOfWork::started();
        if let Some(parent) = self.stack.last() {
            unit.inherit_resources_from(parent);
        }
        self.stack.push(unit);
        self.stack
            .last_mut()
            .expect("scope stack is non-empty after push")
    }

    /// Opens a scope bound to a transaction started with `manager`.
    pub async fn start_with_transaction(
        &mut self,
        manager: Arc<dyn TransactionManager>,
    ) -> Result<&mut UnitOfWork, UnitOfWorkError> {
        let mut unit = UnitOfWork::started();
        if let Some(parent) = self.stack.last() {
            unit.inherit_resources_from(parent);
        }
        unit.bind_transaction(manager).await?;
        self.stack.push(unit);
        Ok(self
            .stack
            .last_mut()
            .expect("scope stack is non-empty after push"))
    }

    /// The innermost active scope, if any.
    pub fn current(&mut self) -> Option<&mut UnitOfWork> {
        self.stack.last_mut()
    }

    /// Whether any scope is active.
    pub fn is_active(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Nesting depth of active scopes.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Commits the innermost scope and detaches it from the stack.
    pub async fn commit(&mut self) -> Result<Vec<Box<dyn AggregateRoot>>, UnitOfWorkError> {
        match self.stack.pop() {
            Some(unit) => unit.commit().await,
            None => Err(UnitOfWorkError::IllegalState {
                expected: "an active scope",
                actual: "no active scope".to_string(),
            }),
        }
    }

    /// Rolls back the innermost scope and detaches it from the stack.
    /// A no-op when no scope is active.
    pub async fn rollback(&mut self, cause: Option<Box<dyn std::error::Error + Send + Sync>>) {
        if let Some(unit) = self.stack.pop() {
            unit.rollback(cause).await;
        }
    }
}
