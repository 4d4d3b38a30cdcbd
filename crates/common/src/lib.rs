//! Shared identifier types used across the command-processing core.

pub mod types;

pub use types::{AggregateId, CommandId, EventId, SequenceNumber};
