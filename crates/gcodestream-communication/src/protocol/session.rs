//! Print session state machine
//!
//! The single place where [`SessionState`] changes. Every transition is
//! driven by a [`SessionEvent`]; events that are not legal in the current
//! state are rejected with `InvalidState` and leave the state untouched.

use gcodestream_core::{EngineError, SessionState};

/// Events that drive the session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Caller asked to connect
    ConnectRequested,
    /// Device answered or the settle timeout elapsed
    HandshakeComplete,
    /// Handshake could not complete
    HandshakeFailed,
    /// Caller started a loaded job
    StartRequested,
    /// Caller paused the job
    PauseRequested,
    /// Caller resumed the job
    ResumeRequested,
    /// Caller aborted the job
    AbortRequested,
    /// Abort bookkeeping is done
    AbortFinished,
    /// Job lane drained and acknowledged
    JobFinished,
    /// Tracker reported a fatal outcome
    Fatal,
    /// Transport failed or closed unexpectedly
    TransportLost,
    /// Caller asked to disconnect
    DisconnectRequested,
    /// Caller cleared an error
    ResetRequested,
}

impl SessionEvent {
    /// Operation name used in `InvalidState` errors
    pub fn operation(&self) -> &'static str {
        match self {
            SessionEvent::ConnectRequested => "connect",
            SessionEvent::HandshakeComplete => "handshake",
            SessionEvent::HandshakeFailed => "handshake",
            SessionEvent::StartRequested => "start_job",
            SessionEvent::PauseRequested => "pause",
            SessionEvent::ResumeRequested => "resume",
            SessionEvent::AbortRequested => "abort",
            SessionEvent::AbortFinished => "abort",
            SessionEvent::JobFinished => "job_complete",
            SessionEvent::Fatal => "fatal",
            SessionEvent::TransportLost => "transport_lost",
            SessionEvent::DisconnectRequested => "disconnect",
            SessionEvent::ResetRequested => "reset",
        }
    }
}

/// Owner of the session state
#[derive(Debug, Default)]
pub struct SessionMachine {
    state: SessionState,
}

impl SessionMachine {
    /// Create a machine in `Disconnected`
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply an event, returning the new state
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState, EngineError> {
        let target = Self::target(self.state, event)
            .ok_or_else(|| EngineError::invalid_state(event.operation(), self.state))?;

        debug_assert!(self.state.can_transition_to(target));
        if target != self.state {
            tracing::info!("Session state: {} -> {}", self.state, target);
            self.state = target;
        }
        Ok(target)
    }

    /// Whether `event` would be accepted right now
    pub fn accepts(&self, event: SessionEvent) -> bool {
        Self::target(self.state, event).is_some()
    }

    fn target(state: SessionState, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (state, event) {
            (S::Disconnected, E::ConnectRequested) => Some(S::Connecting),
            (S::Connecting, E::HandshakeComplete) => Some(S::Online),
            (S::Connecting, E::HandshakeFailed) => Some(S::Disconnected),
            (S::Online, E::StartRequested) => Some(S::Printing),
            (S::Printing, E::PauseRequested) => Some(S::Paused),
            (S::Paused, E::ResumeRequested) => Some(S::Printing),
            (S::Printing | S::Paused, E::AbortRequested) => Some(S::Stopping),
            (S::Stopping, E::AbortFinished) => Some(S::Online),
            (S::Printing, E::JobFinished) => Some(S::Online),
            (S::Connecting, E::TransportLost) => Some(S::Disconnected),
            (S::Online | S::Printing | S::Paused | S::Stopping, E::TransportLost) => {
                Some(S::Errored)
            }
            (S::Disconnected | S::Errored, E::Fatal) => None,
            (_, E::Fatal) => Some(S::Errored),
            (_, E::DisconnectRequested) => Some(S::Disconnected),
            (S::Errored, E::ResetRequested) => Some(S::Disconnected),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(events: &[SessionEvent]) -> SessionMachine {
        let mut m = SessionMachine::new();
        for event in events {
            m.apply(*event).unwrap();
        }
        m
    }

    #[test]
    fn test_happy_path() {
        let m = machine_in(&[
            SessionEvent::ConnectRequested,
            SessionEvent::HandshakeComplete,
            SessionEvent::StartRequested,
            SessionEvent::PauseRequested,
            SessionEvent::ResumeRequested,
            SessionEvent::JobFinished,
        ]);
        assert_eq!(m.state(), SessionState::Online);
    }

    #[test]
    fn test_abort_path() {
        let mut m = machine_in(&[
            SessionEvent::ConnectRequested,
            SessionEvent::HandshakeComplete,
            SessionEvent::StartRequested,
            SessionEvent::PauseRequested,
        ]);
        assert_eq!(m.apply(SessionEvent::AbortRequested).unwrap(), SessionState::Stopping);
        assert_eq!(m.apply(SessionEvent::AbortFinished).unwrap(), SessionState::Online);
    }

    #[test]
    fn test_invalid_requests_leave_state() {
        let mut m = machine_in(&[SessionEvent::ConnectRequested, SessionEvent::HandshakeComplete]);
        let err = m.apply(SessionEvent::PauseRequested).unwrap_err();
        match err {
            EngineError::InvalidState { operation, state } => {
                assert_eq!(operation, "pause");
                assert_eq!(state, SessionState::Online);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(m.state(), SessionState::Online);
        assert!(!m.accepts(SessionEvent::ResumeRequested));
    }

    #[test]
    fn test_errored_only_leaves_by_reset_or_disconnect() {
        let mut m = machine_in(&[
            SessionEvent::ConnectRequested,
            SessionEvent::HandshakeComplete,
            SessionEvent::Fatal,
        ]);
        assert_eq!(m.state(), SessionState::Errored);
        assert!(m.apply(SessionEvent::ConnectRequested).is_err());
        assert!(m.apply(SessionEvent::StartRequested).is_err());
        assert!(m.apply(SessionEvent::Fatal).is_err());
        assert_eq!(m.apply(SessionEvent::ResetRequested).unwrap(), SessionState::Disconnected);
    }

    #[test]
    fn test_transport_loss() {
        let mut connecting = machine_in(&[SessionEvent::ConnectRequested]);
        assert_eq!(
            connecting.apply(SessionEvent::TransportLost).unwrap(),
            SessionState::Disconnected
        );

        let mut printing = machine_in(&[
            SessionEvent::ConnectRequested,
            SessionEvent::HandshakeComplete,
            SessionEvent::StartRequested,
        ]);
        assert_eq!(
            printing.apply(SessionEvent::TransportLost).unwrap(),
            SessionState::Errored
        );
    }

    #[test]
    fn test_disconnect_from_anywhere() {
        let mut m = machine_in(&[
            SessionEvent::ConnectRequested,
            SessionEvent::HandshakeComplete,
            SessionEvent::StartRequested,
        ]);
        assert_eq!(
            m.apply(SessionEvent::DisconnectRequested).unwrap(),
            SessionState::Disconnected
        );
        assert_eq!(
            m.apply(SessionEvent::DisconnectRequested).unwrap(),
            SessionState::Disconnected
        );
    }
}
