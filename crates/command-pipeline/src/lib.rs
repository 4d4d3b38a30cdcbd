//! Command processing pipeline.
//!
//! Producers dispatch commands concurrently into a bounded lane; exactly
//! one worker task consumes them in order and owns all aggregate mutation,
//! so two commands against the same aggregate never execute concurrently
//! and no per-aggregate locks are needed.
//!
//! The worker detects corrupted cached aggregate state (a cached copy that
//! diverged from the durable log) and quarantines it: the aggregate is
//! blacklisted, commands against it fail fast, and a recovery entry evicts
//! the cached copy so the next command reloads cleanly from the store.

pub mod callback;
pub mod error;
pub mod pipeline;
pub mod registry;

pub use callback::{CommandCallback, CommandFuture, FutureCallback};
pub use error::PipelineError;
pub use pipeline::{CommandPipeline, CommandPipelineBuilder};
pub use registry::{CommandHandlerError, CommandHandlerFn, CommandHandlerRegistry};
