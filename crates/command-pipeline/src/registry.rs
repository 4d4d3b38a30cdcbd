//! Explicit command-type to handler mapping.

use std::collections::HashMap;
use std::sync::Arc;

use messaging::CommandMessage;
use unit_of_work::{Aggregate, EventSourcedAggregate};

use crate::error::PipelineError;

/// Error returned by a command handler when it rejects a command.
pub type CommandHandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A command handler: mutates the target aggregate by raising events and
/// returns a result payload delivered to the submitter's callback.
pub type CommandHandlerFn<A> = Arc<
    dyn Fn(
            &CommandMessage,
            &mut EventSourcedAggregate<A>,
        ) -> Result<serde_json::Value, CommandHandlerError>
        + Send
        + Sync,
>;

/// Maps command type keys to handler functions.
///
/// The registry is populated at startup; resolving an unknown key fails
/// with [`PipelineError::NoHandler`].
pub struct CommandHandlerRegistry<A: Aggregate> {
    handlers: HashMap<String, CommandHandlerFn<A>>,
}

impl<A: Aggregate> CommandHandlerRegistry<A> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler under `command_type`, replacing any previous
    /// handler for that key.
    pub fn register<F>(&mut self, command_type: impl Into<String>, handler: F)
    where
        F: Fn(
                &CommandMessage,
                &mut EventSourcedAggregate<A>,
            ) -> Result<serde_json::Value, CommandHandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(command_type.into(), Arc::new(handler));
    }

    /// Resolves the handler for `command_type`.
    pub fn resolve(&self, command_type: &str) -> Result<CommandHandlerFn<A>, PipelineError> {
        self.handlers
            .get(command_type)
            .cloned()
            .ok_or_else(|| PipelineError::NoHandler(command_type.to_string()))
    }

    /// Returns whether a handler is registered for `command_type`.
    pub fn contains(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<A: Aggregate> Default for CommandHandlerRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}
