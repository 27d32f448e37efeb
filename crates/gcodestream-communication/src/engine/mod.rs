//! Engine loop
//!
//! [`Engine`] owns the transport, codec, tracker, send queue and session
//! state of one connection and is driven from a single thread. Control
//! requests reach it as [`Command`] messages; [`handle::StreamingEngine`]
//! is the async front end that sends them.

pub mod handle;

use crate::communication::{ConnectionParams, Transport};
use crate::protocol::{
    AckTracker, ChecksumKind, InFlightLine, Lane, LineCodec, ProtocolEvent, QueuedLine,
    SendQueue, SessionEvent, SessionMachine, TrackerOutcome, WireLine,
};
use gcodestream_core::{
    thread_safe_rw, EngineError, EngineEvent, EventDispatcher, Instruction, Progress,
    ResponseHint, SessionState, ThreadSafeRw, TransportError,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

pub use handle::StreamingEngine;

/// Instruction sent as the first numbered line of a connection and after an
/// abort, so the device's expected line number matches ours
const LINE_SYNC_COMMAND: &str = "M110";

/// Tunables of the engine loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Retransmissions allowed per line before the connection fails
    pub resend_window: u32,
    /// Time without acknowledgment before the in-flight line is resent
    pub ack_timeout: Duration,
    /// Time after opening before the connection counts as settled
    pub handshake_timeout: Duration,
    /// Go online when the handshake timeout elapses on an open transport;
    /// when false the connect attempt fails instead
    pub settle_on_timeout: bool,
    /// Longest a single transport read blocks the loop
    pub read_poll: Duration,
    /// Unnumbered command written while connecting to provoke an answer
    pub probe_command: Option<String>,
    /// Interval between probe commands
    pub probe_interval: Duration,
    /// Checksum algorithm of numbered lines
    pub checksum: ChecksumKind,
    /// Send `N0 M110` on connect and a line sync after abort
    pub reset_line_numbers: bool,
    /// Priority command issued when a job is aborted
    pub halt_command: Option<String>,
    /// Firmware follows a resend request with a bare `ok`
    pub resend_trailing_ok: bool,
    /// `busy:`/`wait` lines restart the ack timer
    pub busy_extends_timeout: bool,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resend_window: 4,
            ack_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(2),
            settle_on_timeout: true,
            read_poll: Duration::from_millis(50),
            probe_command: Some("M105".to_string()),
            probe_interval: Duration::from_millis(1000),
            checksum: ChecksumKind::Xor,
            reset_line_numbers: true,
            halt_command: Some("M410".to_string()),
            resend_trailing_ok: true,
            busy_extends_timeout: true,
            event_buffer: 256,
        }
    }
}

/// State readable outside the loop without a round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineSnapshot {
    /// Current session state
    pub state: SessionState,
    /// Job progress
    pub progress: Progress,
    /// Sequence number of the in-flight line
    pub in_flight: Option<u32>,
    /// Next sequence number to assign
    pub next_sequence: u32,
}

/// Reply channel of a command
pub type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Control requests handled by the engine loop
#[derive(Debug)]
pub enum Command {
    /// Open the transport and start the handshake
    Connect {
        params: ConnectionParams,
        respond_to: Reply<()>,
    },
    /// Close the transport, cancelling any job
    Disconnect { respond_to: Reply<()> },
    /// Load and start a job; replies with the number of job lines
    StartJob {
        instructions: Vec<Instruction>,
        respond_to: Reply<usize>,
    },
    /// Queue an out-of-band instruction
    SendNow {
        instruction: Instruction,
        respond_to: Reply<()>,
    },
    /// Stop drawing job lines
    Pause { respond_to: Reply<()> },
    /// Continue drawing job lines
    Resume { respond_to: Reply<()> },
    /// Cancel the job and halt the device
    Abort { respond_to: Reply<()> },
    /// Leave `Errored`
    Reset { respond_to: Reply<()> },
    /// Disconnect and end the loop
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Streaming engine for one connection
pub struct Engine {
    config: EngineConfig,
    transport: Box<dyn Transport>,
    codec: LineCodec,
    tracker: AckTracker,
    queue: SendQueue,
    session: SessionMachine,
    next_sequence: u32,
    dispatcher: EventDispatcher,
    snapshot: ThreadSafeRw<EngineSnapshot>,
    connect_started: Option<Instant>,
    last_probe: Option<Instant>,
}

impl Engine {
    /// Create an engine around `transport`
    pub fn new(transport: Box<dyn Transport>, config: EngineConfig) -> Self {
        let dispatcher = EventDispatcher::new(config.event_buffer.max(1));
        Self::with_dispatcher(transport, config, dispatcher)
    }

    /// Create an engine publishing on an existing dispatcher
    pub fn with_dispatcher(
        transport: Box<dyn Transport>,
        config: EngineConfig,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            codec: LineCodec::new(config.checksum.strategy()),
            tracker: AckTracker::new(
                config.resend_window,
                config.ack_timeout,
                config.resend_trailing_ok,
            ),
            queue: SendQueue::new(),
            session: SessionMachine::new(),
            next_sequence: 0,
            dispatcher,
            snapshot: thread_safe_rw(EngineSnapshot::default()),
            connect_started: None,
            last_probe: None,
            transport,
            config,
        }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Job progress
    pub fn progress(&self) -> Progress {
        self.queue.progress()
    }

    /// Event dispatcher of this engine
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Shared snapshot updated after every step of the loop
    pub fn snapshot(&self) -> ThreadSafeRw<EngineSnapshot> {
        self.snapshot.clone()
    }

    /// Sequence number of the line awaiting acknowledgment
    pub fn in_flight(&self) -> Option<u32> {
        self.tracker.in_flight().map(|line| line.sequence())
    }

    /// Open the transport and begin the handshake
    ///
    /// Returns once the transport is open; the session reaches `Online` when
    /// the device answers or the settle timeout elapses.
    pub fn connect(&mut self, params: &ConnectionParams) -> Result<(), EngineError> {
        self.transition(SessionEvent::ConnectRequested)?;
        tracing::info!(
            "Connecting to {} at {} baud via {}",
            params.port,
            params.baud_rate,
            self.transport.name()
        );

        if let Err(e) = self.transport.open(params) {
            tracing::error!("Connection failed: {}", e);
            self.transition(SessionEvent::HandshakeFailed)?;
            return Err(EngineError::Transport(e));
        }

        self.tracker.clear();
        self.next_sequence = if self.config.reset_line_numbers { 0 } else { 1 };
        let now = Instant::now();
        self.connect_started = Some(now);
        self.last_probe = None;
        self.probe(now);
        Ok(())
    }

    /// Close the transport; any job is cancelled without completing
    pub fn disconnect(&mut self) -> Result<(), EngineError> {
        self.tracker.clear();
        self.queue.clear_all();
        self.connect_started = None;
        self.transport.close();
        self.transition(SessionEvent::DisconnectRequested)?;
        Ok(())
    }

    /// Load `instructions` as the job lane and start streaming it
    pub fn start_job(&mut self, instructions: Vec<Instruction>) -> Result<usize, EngineError> {
        let total = self.queue.load_job(instructions, self.session.state())?;
        self.transition(SessionEvent::StartRequested)?;
        tracing::info!("Starting job with {} lines", total);
        self.dispatcher
            .publish(EngineEvent::Progress(self.queue.progress()));
        self.pump()?;
        Ok(total)
    }

    /// Queue an instruction ahead of the job lane
    pub fn send_now(&mut self, instruction: Instruction) -> Result<(), EngineError> {
        self.queue
            .enqueue_priority(instruction, self.session.state())?;
        self.pump()
    }

    /// Stop drawing job lines; the in-flight line still completes
    pub fn pause(&mut self) -> Result<(), EngineError> {
        self.transition(SessionEvent::PauseRequested)?;
        Ok(())
    }

    /// Continue the job lane from where it stopped
    pub fn resume(&mut self) -> Result<(), EngineError> {
        self.transition(SessionEvent::ResumeRequested)?;
        self.pump()
    }

    /// Cancel the job and issue the halt command
    ///
    /// Local state always ends up `Online`, or `Errored` when the transport
    /// fails while the halt command is written.
    pub fn abort(&mut self) -> Result<(), EngineError> {
        self.transition(SessionEvent::AbortRequested)?;
        let remaining = self.queue.remaining_job().len();
        self.queue.clear_job();
        if let Some(line) = self.tracker.clear() {
            tracing::debug!("Dropped in-flight line {}", line.sequence());
        }
        tracing::warn!("Job aborted with {} lines unsent", remaining);
        self.transition(SessionEvent::AbortFinished)?;

        // halt goes out first, the line sync follows it
        if self.config.reset_line_numbers {
            self.queue
                .push_front_priority(Instruction::new(LINE_SYNC_COMMAND));
        }
        if let Some(halt) = self.config.halt_command.clone() {
            self.queue.push_front_priority(Instruction::new(halt));
        }
        self.pump()
    }

    /// Leave `Errored`, closing the transport
    pub fn reset(&mut self) -> Result<(), EngineError> {
        self.transition(SessionEvent::ResetRequested)?;
        self.tracker.clear();
        self.queue.clear_all();
        self.transport.close();
        Ok(())
    }

    /// Process one line received from the device
    pub fn handle_line(&mut self, raw: &str) -> Result<(), EngineError> {
        let line = raw.trim();
        if line.is_empty() {
            return Ok(());
        }
        tracing::debug!("RECV: {}", line);

        if self.session.state() == SessionState::Connecting {
            self.dispatcher
                .publish(EngineEvent::Message(line.to_string()));
            return self.complete_handshake();
        }

        let event = self.codec.decode(line);
        match &event {
            ProtocolEvent::Ack(_) => {
                if let Some(report) = self.codec.temperature_in(line) {
                    self.dispatcher.publish(EngineEvent::TemperatureReport(report));
                }
            }
            ProtocolEvent::TemperatureReport(report) => {
                // heating commands report temperatures until they complete
                if self.config.busy_extends_timeout
                    && self.tracker.expects(ResponseHint::Temperature)
                {
                    self.tracker.touch();
                }
                self.dispatcher
                    .publish(EngineEvent::TemperatureReport(report.clone()));
            }
            ProtocolEvent::Busy(_) => {
                if self.config.busy_extends_timeout {
                    self.tracker.touch();
                }
            }
            ProtocolEvent::Error(message) | ProtocolEvent::Unrecognized(message) => {
                self.dispatcher
                    .publish(EngineEvent::Message(message.clone()));
            }
            ProtocolEvent::ResendRequest(_) => {}
        }

        let outcome = self.tracker.on_event(&event);
        self.apply_outcome(outcome)
    }

    /// Run timers: connect probing, settle timeout and ack timeout
    pub fn tick(&mut self, now: Instant) -> Result<(), EngineError> {
        match self.session.state() {
            SessionState::Connecting => {
                let Some(started) = self.connect_started else {
                    return Ok(());
                };
                if now.saturating_duration_since(started) >= self.config.handshake_timeout {
                    if self.config.settle_on_timeout && self.transport.is_open() {
                        tracing::info!("No greeting from device, assuming it is ready");
                        return self.complete_handshake();
                    }
                    tracing::warn!("Handshake timed out");
                    self.connect_started = None;
                    self.transport.close();
                    self.transition(SessionEvent::HandshakeFailed)?;
                    return Ok(());
                }
                self.probe(now);
                Ok(())
            }
            SessionState::Online | SessionState::Printing | SessionState::Paused => {
                match self.tracker.check_timeout(now) {
                    Some(outcome) => self.apply_outcome(outcome),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Read at most one line (waiting up to the poll interval), then run timers
    pub fn poll_once(&mut self) {
        match self.transport.read_line(self.config.read_poll) {
            Ok(Some(line)) => {
                if let Err(e) = self.handle_line(&line) {
                    tracing::debug!("Line not processed: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => self.transport_lost(e),
        }

        if let Err(e) = self.tick(Instant::now()) {
            tracing::debug!("Timer processing failed: {}", e);
        }
        self.refresh_snapshot();
    }

    /// Execute one command; returns false when the loop should end
    pub fn execute(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { params, respond_to } => {
                let _ = respond_to.send(self.connect(&params));
            }
            Command::Disconnect { respond_to } => {
                let _ = respond_to.send(self.disconnect());
            }
            Command::StartJob {
                instructions,
                respond_to,
            } => {
                let _ = respond_to.send(self.start_job(instructions));
            }
            Command::SendNow {
                instruction,
                respond_to,
            } => {
                let _ = respond_to.send(self.send_now(instruction));
            }
            Command::Pause { respond_to } => {
                let _ = respond_to.send(self.pause());
            }
            Command::Resume { respond_to } => {
                let _ = respond_to.send(self.resume());
            }
            Command::Abort { respond_to } => {
                let _ = respond_to.send(self.abort());
            }
            Command::Reset { respond_to } => {
                let _ = respond_to.send(self.reset());
            }
            Command::Shutdown { respond_to } => {
                self.stop();
                let _ = respond_to.send(());
                return false;
            }
        }
        self.refresh_snapshot();
        true
    }

    /// Run until shutdown or until every command sender is gone
    ///
    /// Blocking; call from a dedicated thread or a blocking task. Pending
    /// commands are drained between reads, so a read never delays a control
    /// request by more than the poll interval.
    pub fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::debug!("Engine loop started on {}", self.transport.name());
        loop {
            loop {
                match commands.try_recv() {
                    Ok(command) => {
                        if !self.execute(command) {
                            return;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.stop();
                        return;
                    }
                }
            }

            if self.is_reading() {
                self.poll_once();
                continue;
            }

            match commands.blocking_recv() {
                Some(command) => {
                    if !self.execute(command) {
                        return;
                    }
                }
                None => {
                    self.stop();
                    return;
                }
            }
        }
    }

    fn is_reading(&self) -> bool {
        !matches!(
            self.session.state(),
            SessionState::Disconnected | SessionState::Errored
        ) && self.transport.is_open()
    }

    fn stop(&mut self) {
        if let Err(e) = self.disconnect() {
            tracing::debug!("Disconnect during shutdown failed: {}", e);
        }
        self.refresh_snapshot();
        tracing::debug!("Engine loop stopped");
    }

    fn transition(&mut self, event: SessionEvent) -> Result<SessionState, EngineError> {
        let before = self.session.state();
        let after = self.session.apply(event)?;
        if after != before {
            self.dispatcher.publish(EngineEvent::StateChanged(after));
            self.refresh_snapshot();
        }
        Ok(after)
    }

    fn complete_handshake(&mut self) -> Result<(), EngineError> {
        self.connect_started = None;
        self.last_probe = None;
        self.transition(SessionEvent::HandshakeComplete)?;
        if self.config.reset_line_numbers {
            self.queue
                .push_front_priority(Instruction::new(LINE_SYNC_COMMAND));
        }
        self.pump()
    }

    fn probe(&mut self, now: Instant) {
        let Some(command) = self.config.probe_command.as_deref() else {
            return;
        };
        let due = self
            .last_probe
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.probe_interval);
        if !due {
            return;
        }

        self.last_probe = Some(now);
        tracing::debug!("SENT: {}", command);
        if let Err(e) = self.transport.write_line(command.as_bytes()) {
            self.transport_lost(e);
        }
    }

    fn apply_outcome(&mut self, outcome: TrackerOutcome) -> Result<(), EngineError> {
        match outcome {
            TrackerOutcome::Resolved(line) => {
                tracing::debug!("Line {} acknowledged", line.sequence());
                self.queue.mark_acknowledged(line.lane);
                if line.lane == Lane::Job {
                    self.dispatcher
                        .publish(EngineEvent::Progress(self.queue.progress()));
                }
                self.pump()
            }
            TrackerOutcome::Resend(line) => {
                self.queue.requeue_front(line);
                self.pump()
            }
            TrackerOutcome::Fatal(error) => {
                self.fail(error.clone());
                Err(error)
            }
            TrackerOutcome::Stale | TrackerOutcome::Informational => Ok(()),
        }
    }

    /// Transmit as long as flow control allows, then check for job completion
    fn pump(&mut self) -> Result<(), EngineError> {
        while self.tracker.is_idle() {
            let Some(next) = self.queue.next(self.session.state()) else {
                break;
            };

            match next {
                QueuedLine::Fresh { instruction, lane } => {
                    let wire = self.codec.encode(self.next_sequence, &instruction);
                    self.next_sequence = self.next_sequence.wrapping_add(1);
                    self.write(&wire)?;
                    let line = InFlightLine::new(wire, lane).with_hint(instruction.expect());
                    self.tracker.submit_line(line)?;
                }
                QueuedLine::Retransmit(line) => {
                    self.write(&line.wire_line)?;
                    self.tracker.resubmit(line)?;
                }
            }
        }

        self.check_job_complete()
    }

    fn write(&mut self, wire: &WireLine) -> Result<(), EngineError> {
        tracing::debug!("SENT: {}", wire);
        if let Err(e) = self.transport.write_line(&wire.raw) {
            self.transport_lost(e.clone());
            return Err(EngineError::Transport(e));
        }
        Ok(())
    }

    fn check_job_complete(&mut self) -> Result<(), EngineError> {
        if self.session.state() == SessionState::Printing
            && self.queue.job_drained()
            && self.queue.priority_empty()
            && self.tracker.is_idle()
        {
            let progress = self.queue.progress();
            self.transition(SessionEvent::JobFinished)?;
            tracing::info!("Job complete: {}", progress);
            self.dispatcher.publish(EngineEvent::JobComplete(progress));
        }
        Ok(())
    }

    fn fail(&mut self, error: EngineError) {
        tracing::error!("Fatal protocol error: {}", error);
        self.tracker.clear();
        self.queue.clear_all();
        if self.transition(SessionEvent::Fatal).is_ok() {
            self.dispatcher.publish(EngineEvent::Fatal(error.to_string()));
        }
    }

    fn transport_lost(&mut self, error: TransportError) {
        tracing::error!("Transport failure on {}: {}", self.transport.name(), error);
        self.tracker.clear();
        self.queue.clear_job();
        self.connect_started = None;
        self.transport.close();
        match self.transition(SessionEvent::TransportLost) {
            Ok(SessionState::Errored) => {
                self.queue.clear_all();
                self.dispatcher.publish(EngineEvent::Fatal(error.to_string()));
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Transport loss ignored: {}", e),
        }
    }

    fn refresh_snapshot(&self) {
        let mut snapshot = self.snapshot.write();
        snapshot.state = self.session.state();
        snapshot.progress = self.queue.progress();
        snapshot.in_flight = self.in_flight();
        snapshot.next_sequence = self.next_sequence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::memory::{MemoryDevice, MemoryTransport};

    fn config() -> EngineConfig {
        EngineConfig {
            probe_command: None,
            halt_command: Some("M410".to_string()),
            resend_window: 3,
            ..Default::default()
        }
    }

    fn online(config: EngineConfig) -> (Engine, MemoryDevice) {
        let (transport, device) = MemoryTransport::pair();
        let mut engine = Engine::new(Box::new(transport), config);
        engine
            .connect(&ConnectionParams::new("/dev/null", 115200))
            .unwrap();
        engine.handle_line("start").unwrap();
        assert_eq!(engine.state(), SessionState::Online);
        // N0 M110 in flight
        engine.handle_line("ok").unwrap();
        (engine, device)
    }

    fn job(lines: &[&str]) -> Vec<Instruction> {
        lines.iter().map(|l| Instruction::new(*l)).collect()
    }

    #[test]
    fn test_handshake_sends_line_sync() {
        let (engine, device) = online(config());
        assert_eq!(device.sent_numbered(), vec!["N0 M110*35".to_string()]);
        assert!(engine.in_flight().is_none());
    }

    #[test]
    fn test_connect_failure_returns_to_disconnected() {
        let (transport, device) = MemoryTransport::pair();
        device.fail_next_open();
        let mut engine = Engine::new(Box::new(transport), config());
        let err = engine
            .connect(&ConnectionParams::new("/dev/null", 115200))
            .unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
        assert_eq!(engine.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_settle_timeout_goes_online() {
        let (transport, _device) = MemoryTransport::pair();
        let mut engine = Engine::new(Box::new(transport), config());
        engine
            .connect(&ConnectionParams::new("/dev/null", 115200))
            .unwrap();
        engine
            .tick(Instant::now() + Duration::from_secs(3))
            .unwrap();
        assert_eq!(engine.state(), SessionState::Online);
    }

    #[test]
    fn test_handshake_timeout_without_settle_disconnects() {
        let (transport, device) = MemoryTransport::pair();
        let mut engine = Engine::new(
            Box::new(transport),
            EngineConfig {
                settle_on_timeout: false,
                ..config()
            },
        );
        engine
            .connect(&ConnectionParams::new("/dev/null", 115200))
            .unwrap();
        engine
            .tick(Instant::now() + Duration::from_secs(3))
            .unwrap();
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert!(!device.is_open());
    }

    #[test]
    fn test_three_line_job_completes() {
        let (mut engine, device) = online(config());
        let mut events = engine.dispatcher().subscribe();

        assert_eq!(engine.start_job(job(&["G28", "G1 X10", "G1 X20"])).unwrap(), 3);
        for _ in 0..3 {
            engine.handle_line("ok").unwrap();
        }

        assert_eq!(engine.state(), SessionState::Online);
        assert_eq!(engine.progress(), Progress::new(3, 3));
        assert!(engine.in_flight().is_none());
        assert_eq!(
            device.sent_numbered(),
            vec![
                "N0 M110*35".to_string(),
                "N1 G28*18".to_string(),
                "N2 G1 X10*83".to_string(),
                "N3 G1 X20*81".to_string(),
            ]
        );

        let mut completed = false;
        while let Ok(stamped) = events.try_recv() {
            if let EngineEvent::JobComplete(progress) = stamped.event {
                assert_eq!(progress, Progress::new(3, 3));
                completed = true;
            }
        }
        assert!(completed);
    }

    #[test]
    fn test_resend_retransmits_identical_line() {
        let (mut engine, device) = online(config());
        engine.start_job(job(&["G28", "G1 X10", "G1 X20"])).unwrap();
        engine.handle_line("ok").unwrap();

        engine.handle_line("Resend: 2").unwrap();
        engine.handle_line("ok").unwrap();
        engine.handle_line("ok").unwrap();

        let sent = device.sent_numbered();
        assert_eq!(sent[2], "N2 G1 X10*83");
        assert_eq!(sent[3], "N2 G1 X10*83");
        assert_eq!(sent[4], "N3 G1 X20*81");
        assert_eq!(engine.in_flight(), Some(3));
    }

    #[test]
    fn test_numbered_ack_after_resend_keeps_job_moving() {
        let (mut engine, device) = online(config());
        engine.start_job(job(&["G28", "G1 X10", "G1 X20"])).unwrap();
        engine.handle_line("ok").unwrap();

        engine.handle_line("Resend: 2").unwrap();
        engine.handle_line("ok N2").unwrap();
        assert_eq!(engine.in_flight(), Some(3));
        engine.handle_line("ok").unwrap();

        assert_eq!(engine.state(), SessionState::Online);
        assert_eq!(engine.progress(), Progress::new(3, 3));
        assert_eq!(device.sent_numbered().last().map(String::as_str), Some("N3 G1 X20*81"));
    }

    #[test]
    fn test_keepalives_hold_off_ack_timeout() {
        for keepalive in ["echo:busy: processing", " T:58.1 /60.0 B:55.2 /60.0 W:?"] {
            let (mut engine, device) = online(EngineConfig {
                ack_timeout: Duration::from_millis(100),
                ..config()
            });
            engine.start_job(job(&["M190 S60"])).unwrap();

            for _ in 0..4 {
                std::thread::sleep(Duration::from_millis(40));
                engine.handle_line(keepalive).unwrap();
            }
            engine.tick(Instant::now()).unwrap();

            assert_eq!(engine.in_flight(), Some(1));
            assert_eq!(device.sent_numbered().len(), 2, "retransmitted on {:?}", keepalive);
        }
    }

    #[test]
    fn test_temperature_autoreport_does_not_mask_lost_line() {
        let (mut engine, device) = online(EngineConfig {
            ack_timeout: Duration::from_millis(100),
            ..config()
        });
        engine.start_job(job(&["G1 X10"])).unwrap();

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(40));
            engine.handle_line("T:200.0 /200.0 B:60.0 /60.0").unwrap();
        }
        engine.tick(Instant::now()).unwrap();

        assert_eq!(device.sent_numbered().len(), 3);
    }

    #[test]
    fn test_silence_still_times_out() {
        let (mut engine, device) = online(EngineConfig {
            ack_timeout: Duration::from_millis(100),
            ..config()
        });
        engine.start_job(job(&["M190 S60"])).unwrap();
        engine
            .tick(Instant::now() + Duration::from_millis(150))
            .unwrap();
        assert_eq!(device.sent_numbered().len(), 3);
    }

    #[test]
    fn test_resend_exhaustion_errors() {
        let (mut engine, device) = online(EngineConfig {
            resend_trailing_ok: false,
            ..config()
        });
        engine.start_job(job(&["G28", "G1 X10"])).unwrap();

        for _ in 0..3 {
            engine.handle_line("Resend: 1").unwrap();
        }
        let err = engine.handle_line("Resend: 1").unwrap_err();
        assert!(matches!(err, EngineError::ResendExhausted { sequence: 1, .. }));
        assert_eq!(engine.state(), SessionState::Errored);

        let before = device.sent().len();
        assert!(engine.send_now(Instruction::new("M105")).is_err());
        engine.handle_line("ok").unwrap();
        assert_eq!(device.sent().len(), before);
    }

    #[test]
    fn test_send_now_preempts_job_lane() {
        let (mut engine, device) = online(config());
        engine.start_job(job(&["G28", "G1 X10"])).unwrap();
        engine.send_now(Instruction::new("M105")).unwrap();
        engine.handle_line("ok").unwrap();

        let sent = device.sent_numbered();
        assert_eq!(sent[1], "N1 G28*18");
        assert!(sent[2].starts_with("N2 M105*"));
    }

    #[test]
    fn test_abort_clears_job_and_halts() {
        let (mut engine, device) = online(config());
        engine
            .start_job(job(&["G1 X1", "G1 X2", "G1 X3", "G1 X4", "G1 X5"]))
            .unwrap();
        engine.handle_line("ok").unwrap();
        engine.handle_line("ok").unwrap();

        engine.abort().unwrap();
        assert_eq!(engine.state(), SessionState::Online);
        assert_eq!(engine.progress(), Progress::new(0, 0));

        engine.handle_line("ok").unwrap();
        engine.handle_line("ok").unwrap();
        engine.handle_line("ok").unwrap();

        let sent = device.sent_numbered();
        let after_abort: Vec<&String> = sent.iter().skip(4).collect();
        assert_eq!(after_abort.len(), 2);
        assert!(after_abort[0].starts_with("N4 M410*"));
        assert!(after_abort[1].starts_with("N5 M110*"));
    }

    #[test]
    fn test_transport_loss_during_print_errors() {
        let (mut engine, device) = online(config());
        engine.start_job(job(&["G28"])).unwrap();
        device.hang_up();
        engine.poll_once();
        assert_eq!(engine.state(), SessionState::Errored);
        engine.reset().unwrap();
        assert_eq!(engine.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_temperature_piggyback_resolves_ack() {
        let (mut engine, _device) = online(config());
        let mut events = engine.dispatcher().subscribe();
        engine.send_now(Instruction::new("M105")).unwrap();
        engine.handle_line("ok T:20.5 /0.0 B:21.0 /0.0").unwrap();

        assert!(engine.in_flight().is_none());
        let mut saw_report = false;
        while let Ok(stamped) = events.try_recv() {
            if let EngineEvent::TemperatureReport(report) = stamped.event {
                assert!(report.get("T").is_some());
                saw_report = true;
            }
        }
        assert!(saw_report);
    }
}
