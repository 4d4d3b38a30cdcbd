//! Replay coordination for event-sourced consumers.
//!
//! [`ReplayingEventBus`] wraps a live dispatch target and adds the ability
//! to replay historical events from the store. While a replay runs, live
//! events are diverted to an [`IncomingMessageHandler`] instead of the
//! wrapped target, and are reconciled with the historical stream before
//! live delivery resumes, preserving one total order per aggregate across
//! the live/historical boundary.

pub mod bus;
pub mod error;
pub mod incoming;
pub mod monitor;
pub mod replaying;

pub use bus::{
    EventBus, EventHandlingError, EventListener, EventProcessingMonitor, ReplayAware,
    SimpleEventBus,
};
pub use error::ReplayError;
pub use incoming::{
    BackloggingIncomingMessageHandler, DiscardingIncomingMessageHandler, IncomingMessageHandler,
};
pub use replaying::{ReplayStatus, ReplayingEventBus, join_replay};
