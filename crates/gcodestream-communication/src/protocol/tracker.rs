//! Acknowledgment Tracker
//!
//! Enforces single-credit flow control: at most one unacknowledged line is
//! outstanding at any time. Resolves it on a matching acknowledgment and
//! drives the resend protocol, both for explicit resend requests and for
//! acknowledgment timeouts.

use crate::protocol::codec::{is_recoverable_error, ProtocolEvent, WireLine};
use crate::protocol::queue::Lane;
use gcodestream_core::{EngineError, ResponseHint};
use std::time::{Duration, Instant};

/// The single outstanding line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightLine {
    /// The encoded line as written to the transport
    pub wire_line: WireLine,
    /// Which lane the line was drawn from
    pub lane: Lane,
    /// Number of retransmissions made so far
    pub retry_count: u32,
    /// When the line was first transmitted
    pub enqueued_at: Instant,
    /// Last transmission or keepalive; the ack timeout runs from here
    pub last_activity: Instant,
    /// Response the instruction is expected to produce
    pub expect: Option<ResponseHint>,
}

impl InFlightLine {
    /// Create a fresh in-flight line with no retries
    pub fn new(wire_line: WireLine, lane: Lane) -> Self {
        let now = Instant::now();
        Self {
            wire_line,
            lane,
            retry_count: 0,
            enqueued_at: now,
            last_activity: now,
            expect: None,
        }
    }

    /// Set the expected-response hint
    pub fn with_hint(mut self, expect: Option<ResponseHint>) -> Self {
        self.expect = expect;
        self
    }

    /// Sequence number of the line
    pub fn sequence(&self) -> u32 {
        self.wire_line.sequence
    }
}

/// Result of feeding a protocol event to the tracker
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerOutcome {
    /// The in-flight line was acknowledged and cleared
    Resolved(InFlightLine),
    /// Acknowledgment or resend that does not match the in-flight line; ignored
    Stale,
    /// The in-flight line must be retransmitted; carries the next attempt
    Resend(InFlightLine),
    /// The connection cannot continue
    Fatal(EngineError),
    /// Does not affect flow control
    Informational,
}

/// Tracks the in-flight line and its retries
#[derive(Debug)]
pub struct AckTracker {
    in_flight: Option<InFlightLine>,
    resend_window: u32,
    ack_timeout: Duration,
    resend_trailing_ok: bool,
    swallow_bare_ok: bool,
}

impl AckTracker {
    /// Create a tracker
    ///
    /// # Arguments
    /// * `resend_window` - retransmissions allowed per line before the
    ///   connection is failed
    /// * `ack_timeout` - how long to wait for an acknowledgment before
    ///   retransmitting
    /// * `resend_trailing_ok` - firmware follows a resend request with a bare
    ///   `ok` that belongs to the rejected line
    pub fn new(resend_window: u32, ack_timeout: Duration, resend_trailing_ok: bool) -> Self {
        Self {
            in_flight: None,
            resend_window,
            ack_timeout,
            resend_trailing_ok,
            swallow_bare_ok: false,
        }
    }

    /// The outstanding line, if any
    pub fn in_flight(&self) -> Option<&InFlightLine> {
        self.in_flight.as_ref()
    }

    /// Whether a new line may be submitted
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Mark a freshly transmitted line as in flight
    pub fn submit(&mut self, wire_line: WireLine, lane: Lane) -> Result<(), EngineError> {
        self.submit_line(InFlightLine::new(wire_line, lane))
    }

    /// Mark a fresh line, built by the caller, as in flight
    pub fn submit_line(&mut self, line: InFlightLine) -> Result<(), EngineError> {
        self.resubmit(line)?;
        self.swallow_bare_ok = false;
        Ok(())
    }

    /// Whether the in-flight line expects `hint`
    pub fn expects(&self, hint: ResponseHint) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|line| line.expect == Some(hint))
    }

    /// Mark a retransmission attempt as in flight
    pub fn resubmit(&mut self, mut line: InFlightLine) -> Result<(), EngineError> {
        if let Some(current) = &self.in_flight {
            return Err(EngineError::violation(format!(
                "line {} is still awaiting acknowledgment",
                current.sequence()
            )));
        }
        line.last_activity = Instant::now();
        self.in_flight = Some(line);
        Ok(())
    }

    /// Feed one decoded device line
    pub fn on_event(&mut self, event: &ProtocolEvent) -> TrackerOutcome {
        match event {
            ProtocolEvent::Ack(number) => self.on_ack(*number),
            ProtocolEvent::ResendRequest(number) => self.on_resend(*number),
            ProtocolEvent::Error(message) => self.on_error(message),
            ProtocolEvent::TemperatureReport(_)
            | ProtocolEvent::Busy(_)
            | ProtocolEvent::Unrecognized(_) => TrackerOutcome::Informational,
        }
    }

    /// Check the ack timeout; a silent device is treated like a resend request
    pub fn check_timeout(&mut self, now: Instant) -> Option<TrackerOutcome> {
        let line = self.in_flight.as_ref()?;
        if now.saturating_duration_since(line.last_activity) < self.ack_timeout {
            return None;
        }

        let timeout = EngineError::Timeout {
            sequence: line.sequence(),
            timeout_ms: self.ack_timeout.as_millis() as u64,
        };
        tracing::warn!("{}", timeout);
        self.swallow_bare_ok = false;
        Some(self.reissue())
    }

    /// Restart the ack timer of the in-flight line (firmware keepalive)
    pub fn touch(&mut self) {
        if let Some(line) = self.in_flight.as_mut() {
            line.last_activity = Instant::now();
        }
    }

    /// Drop all bookkeeping (abort, disconnect)
    pub fn clear(&mut self) -> Option<InFlightLine> {
        self.swallow_bare_ok = false;
        self.in_flight.take()
    }

    fn on_ack(&mut self, number: Option<u32>) -> TrackerOutcome {
        match (number, &self.in_flight) {
            (None, _) if self.swallow_bare_ok => {
                self.swallow_bare_ok = false;
                tracing::debug!("Consumed trailing ok of a resend request");
                TrackerOutcome::Stale
            }
            (None, Some(_)) => self.resolve(),
            (Some(n), Some(line)) if n == line.sequence() => self.resolve(),
            (number, current) => {
                tracing::warn!(
                    "Stale acknowledgment {:?} (in flight: {:?})",
                    number,
                    current.as_ref().map(|l| l.sequence())
                );
                TrackerOutcome::Stale
            }
        }
    }

    fn on_resend(&mut self, number: u32) -> TrackerOutcome {
        match &self.in_flight {
            Some(line) if line.sequence() == number => {
                if self.resend_trailing_ok {
                    self.swallow_bare_ok = true;
                }
                self.reissue()
            }
            current => {
                tracing::warn!(
                    "Ignoring resend request for line {} (in flight: {:?})",
                    number,
                    current.as_ref().map(|l| l.sequence())
                );
                TrackerOutcome::Stale
            }
        }
    }

    fn on_error(&mut self, message: &str) -> TrackerOutcome {
        if is_recoverable_error(message) {
            tracing::warn!("Device reported line error: {}", message);
            return TrackerOutcome::Informational;
        }

        match &self.in_flight {
            Some(_) => {
                self.in_flight = None;
                TrackerOutcome::Fatal(EngineError::DeviceReportedError {
                    message: message.to_string(),
                })
            }
            None => {
                tracing::warn!("Device error with no line in flight: {}", message);
                TrackerOutcome::Informational
            }
        }
    }

    fn resolve(&mut self) -> TrackerOutcome {
        // a trailing ok never outlives the line it was announced for
        self.swallow_bare_ok = false;
        match self.in_flight.take() {
            Some(line) => TrackerOutcome::Resolved(line),
            None => TrackerOutcome::Stale,
        }
    }

    fn reissue(&mut self) -> TrackerOutcome {
        let Some(mut line) = self.in_flight.take() else {
            return TrackerOutcome::Stale;
        };

        line.retry_count += 1;
        if line.retry_count > self.resend_window {
            return TrackerOutcome::Fatal(EngineError::ResendExhausted {
                sequence: line.sequence(),
                attempts: line.retry_count,
            });
        }

        tracing::warn!(
            "Resending line {} (attempt {}/{})",
            line.sequence(),
            line.retry_count,
            self.resend_window
        );
        TrackerOutcome::Resend(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::LineCodec;
    use gcodestream_core::Instruction;

    fn wire(seq: u32, text: &str) -> WireLine {
        LineCodec::default().encode(seq, &Instruction::new(text))
    }

    fn tracker() -> AckTracker {
        AckTracker::new(3, Duration::from_secs(5), false)
    }

    #[test]
    fn test_double_submit_is_violation() {
        let mut t = tracker();
        t.submit(wire(1, "G28"), Lane::Job).unwrap();
        let err = t.submit(wire(2, "G1 X10"), Lane::Job).unwrap_err();
        assert!(matches!(err, EngineError::ProtocolViolation { .. }));
        assert_eq!(t.in_flight().unwrap().sequence(), 1);
    }

    #[test]
    fn test_matching_ack_resolves() {
        let mut t = tracker();
        t.submit(wire(1, "G28"), Lane::Job).unwrap();
        match t.on_event(&ProtocolEvent::Ack(Some(1))) {
            TrackerOutcome::Resolved(line) => assert_eq!(line.sequence(), 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(t.is_idle());
    }

    #[test]
    fn test_stale_ack_keeps_in_flight() {
        let mut t = tracker();
        t.submit(wire(5, "G1 X1"), Lane::Job).unwrap();
        assert_eq!(t.on_event(&ProtocolEvent::Ack(Some(4))), TrackerOutcome::Stale);
        assert_eq!(t.in_flight().unwrap().sequence(), 5);

        let mut idle = tracker();
        assert_eq!(idle.on_event(&ProtocolEvent::Ack(None)), TrackerOutcome::Stale);
    }

    #[test]
    fn test_resend_reissues_same_line() {
        let mut t = tracker();
        let line = wire(2, "G1 X10");
        t.submit(line.clone(), Lane::Job).unwrap();

        match t.on_event(&ProtocolEvent::ResendRequest(2)) {
            TrackerOutcome::Resend(attempt) => {
                assert_eq!(attempt.wire_line, line);
                assert_eq!(attempt.retry_count, 1);
                assert!(t.is_idle());
                t.resubmit(attempt).unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(t.in_flight().unwrap().retry_count, 1);
    }

    #[test]
    fn test_resend_for_other_line_is_stale() {
        let mut t = tracker();
        t.submit(wire(3, "G1 X20"), Lane::Job).unwrap();
        assert_eq!(
            t.on_event(&ProtocolEvent::ResendRequest(2)),
            TrackerOutcome::Stale
        );
        assert_eq!(t.in_flight().unwrap().retry_count, 0);
    }

    #[test]
    fn test_resend_window_exhaustion() {
        let mut t = tracker();
        t.submit(wire(2, "G1 X10"), Lane::Job).unwrap();

        for attempt in 1..=3 {
            match t.on_event(&ProtocolEvent::ResendRequest(2)) {
                TrackerOutcome::Resend(line) => {
                    assert_eq!(line.retry_count, attempt);
                    t.resubmit(line).unwrap();
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        match t.on_event(&ProtocolEvent::ResendRequest(2)) {
            TrackerOutcome::Fatal(EngineError::ResendExhausted { sequence, attempts }) => {
                assert_eq!(sequence, 2);
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(t.is_idle());
    }

    #[test]
    fn test_trailing_ok_after_resend_is_swallowed() {
        let mut t = AckTracker::new(3, Duration::from_secs(5), true);
        t.submit(wire(2, "G1 X10"), Lane::Job).unwrap();
        let TrackerOutcome::Resend(line) = t.on_event(&ProtocolEvent::ResendRequest(2)) else {
            panic!("expected resend");
        };
        t.resubmit(line).unwrap();

        assert_eq!(t.on_event(&ProtocolEvent::Ack(None)), TrackerOutcome::Stale);
        assert!(!t.is_idle());
        assert!(matches!(
            t.on_event(&ProtocolEvent::Ack(None)),
            TrackerOutcome::Resolved(_)
        ));
    }

    #[test]
    fn test_numbered_ack_after_resend_clears_trailing_ok() {
        let mut t = AckTracker::new(3, Duration::from_secs(5), true);
        t.submit(wire(2, "G1 X10"), Lane::Job).unwrap();
        let TrackerOutcome::Resend(line) = t.on_event(&ProtocolEvent::ResendRequest(2)) else {
            panic!("expected resend");
        };
        t.resubmit(line).unwrap();

        assert!(matches!(
            t.on_event(&ProtocolEvent::Ack(Some(2))),
            TrackerOutcome::Resolved(_)
        ));

        t.submit(wire(3, "G1 X20"), Lane::Job).unwrap();
        match t.on_event(&ProtocolEvent::Ack(None)) {
            TrackerOutcome::Resolved(line) => assert_eq!(line.sequence(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expects_follows_in_flight_hint() {
        let mut t = tracker();
        assert!(!t.expects(ResponseHint::Temperature));

        let line = InFlightLine::new(wire(1, "M190 S60"), Lane::Job)
            .with_hint(Some(ResponseHint::Temperature));
        t.submit_line(line).unwrap();
        assert!(t.expects(ResponseHint::Temperature));

        t.on_event(&ProtocolEvent::Ack(None));
        t.submit(wire(2, "G1 X1"), Lane::Job).unwrap();
        assert!(!t.expects(ResponseHint::Temperature));
    }

    #[test]
    fn test_device_error_is_fatal_while_in_flight() {
        let mut t = tracker();
        t.submit(wire(1, "M109 S200"), Lane::Job).unwrap();
        match t.on_event(&ProtocolEvent::Error("Printer halted".into())) {
            TrackerOutcome::Fatal(EngineError::DeviceReportedError { message }) => {
                assert_eq!(message, "Printer halted")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_line_errors_are_recoverable() {
        let mut t = tracker();
        t.submit(wire(6, "G1 X1"), Lane::Job).unwrap();
        assert_eq!(
            t.on_event(&ProtocolEvent::Error(
                "checksum mismatch, Last Line: 5".into()
            )),
            TrackerOutcome::Informational
        );
        assert!(!t.is_idle());
    }

    #[test]
    fn test_timeout_triggers_resend() {
        let mut t = AckTracker::new(1, Duration::from_millis(100), false);
        t.submit(wire(1, "G28"), Lane::Job).unwrap();

        let now = Instant::now();
        assert!(t.check_timeout(now).is_none());

        let later = now + Duration::from_millis(150);
        let Some(TrackerOutcome::Resend(line)) = t.check_timeout(later) else {
            panic!("expected resend");
        };
        t.resubmit(line).unwrap();

        let much_later = Instant::now() + Duration::from_millis(150);
        assert!(matches!(
            t.check_timeout(much_later),
            Some(TrackerOutcome::Fatal(EngineError::ResendExhausted { .. }))
        ));
    }

    #[test]
    fn test_informational_events() {
        let mut t = tracker();
        assert_eq!(
            t.on_event(&ProtocolEvent::Unrecognized("echo:busy".into())),
            TrackerOutcome::Informational
        );
        assert_eq!(
            t.on_event(&ProtocolEvent::Busy("busy: processing".into())),
            TrackerOutcome::Informational
        );
    }
}
