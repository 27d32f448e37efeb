//! Event system for engine observers
//!
//! Provides:
//! - Event types for session state changes, progress, and device reports
//! - Event dispatcher for publishing events to subscribers

use crate::data::{Progress, SessionState, TemperatureReport};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Engine event types
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Session state changed
    StateChanged(SessionState),
    /// A job-lane line was acknowledged
    Progress(Progress),
    /// The device reported temperatures
    TemperatureReport(TemperatureReport),
    /// A fatal error stopped the connection
    Fatal(String),
    /// The job lane drained and every line was acknowledged
    JobComplete(Progress),
    /// Any other device output (echo lines, firmware chatter)
    Message(String),
}

impl std::fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::StateChanged(state) => write!(f, "State: {}", state),
            EngineEvent::Progress(progress) => write!(f, "Progress: {}", progress),
            EngineEvent::TemperatureReport(report) => write!(f, "Temperature: {}", report),
            EngineEvent::Fatal(reason) => write!(f, "Fatal: {}", reason),
            EngineEvent::JobComplete(progress) => {
                write!(f, "Job complete: {} lines", progress.total)
            }
            EngineEvent::Message(msg) => write!(f, "Device: {}", msg),
        }
    }
}

/// An event stamped with the time it was published
#[derive(Debug, Clone)]
pub struct TimestampedEvent {
    /// The event
    pub event: EngineEvent,
    /// When it was published
    pub at: DateTime<Utc>,
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher {
    /// Broadcast sender channel for engine events.
    tx: broadcast::Sender<TimestampedEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Size of the broadcast buffer (default 256)
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of subscribers that received it. Publishing with no
    /// subscribers is not an error for the engine, so it yields 0.
    pub fn publish(&self, event: EngineEvent) -> usize {
        tracing::trace!("Publishing {}", event);
        let stamped = TimestampedEvent {
            event,
            at: Utc::now(),
        };
        self.tx.send(stamped).unwrap_or(0)
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}
