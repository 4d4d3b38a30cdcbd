//! Message model for the command-processing core.
//!
//! This crate provides the immutable envelopes flowing through the system:
//! - [`CommandMessage`] for intents routed to exactly one handler
//! - [`EventMessage`] and [`DomainEventMessage`] for published facts
//! - [`MetaData`], a copy-on-write key-value map attached to every message
//! - [`EventPublisher`], the seam through which committed events are delivered

pub mod command;
pub mod event;
pub mod metadata;
pub mod publisher;

pub use command::CommandMessage;
pub use event::{DomainEventMessage, DomainEventMessageBuilder, EventMessage};
pub use metadata::MetaData;
pub use publisher::{EventPublisher, PublicationError};
