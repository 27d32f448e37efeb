//! Engine observer plumbing: events and listeners

pub mod event;
pub mod listener;

pub use event::{EngineEvent, EventDispatcher, TimestampedEvent};
pub use listener::{EngineListener, EngineListenerHandle};
