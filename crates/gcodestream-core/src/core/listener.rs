//! Engine listener interface
//!
//! Defines the observer trait for engine events

use crate::data::{Progress, SessionState, TemperatureReport};
use async_trait::async_trait;
use uuid::Uuid;

/// Handle for a registered engine listener.
///
/// Uniquely identifies a listener subscription. Can be used to unsubscribe
/// from engine events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineListenerHandle(pub String);

impl EngineListenerHandle {
    /// Create a new unique handle
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for EngineListenerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener trait for engine events
///
/// Implement this trait to receive notifications from the streaming engine.
#[async_trait]
pub trait EngineListener: Send + Sync {
    /// Called when the session state changes
    async fn on_state_changed(&self, _new_state: SessionState) {}

    /// Called when a job-lane line is acknowledged
    async fn on_progress(&self, _progress: Progress) {}

    /// Called when the device reports temperatures
    async fn on_temperature(&self, _report: &TemperatureReport) {}

    /// Called when a fatal error stops the connection
    async fn on_fatal(&self, _reason: &str) {}

    /// Called when a job completes
    async fn on_job_complete(&self, _progress: Progress) {}

    /// Called for other device output
    async fn on_message(&self, _message: &str) {}
}
