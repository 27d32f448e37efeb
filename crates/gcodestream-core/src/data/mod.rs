//! Data models for the streaming engine
//!
//! Contains the session state, the instruction payloads handed to the
//! engine, job progress, and parsed temperature reports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a print session
///
/// Owned exclusively by the engine loop. Transitions only happen through
/// documented events, see [`SessionState::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionState {
    /// No transport open
    #[default]
    Disconnected,
    /// Transport open, waiting for the device to answer
    Connecting,
    /// Device answered, no job active
    Online,
    /// Job lane is being streamed
    Printing,
    /// Job lane consumption suspended, priority lane still served
    Paused,
    /// Abort in progress
    Stopping,
    /// Fatal protocol or transport failure; only reset leaves this state
    Errored,
}

impl SessionState {
    /// Check if a transition from this state to `target` is valid.
    ///
    /// Returns `true` for valid transitions:
    /// - Disconnected → Connecting
    /// - Connecting → Online, Disconnected
    /// - Online → Printing
    /// - Printing → Paused, Stopping, Online (job complete)
    /// - Paused → Printing, Stopping
    /// - Stopping → Online
    /// - any → Errored (except Disconnected), any → Disconnected
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        if *self == target {
            return true;
        }
        match (self, target) {
            (_, Disconnected) => true,
            (Disconnected, Errored) => false,
            (Errored, _) => false,
            (_, Errored) => true,
            _ => matches!(
                (self, target),
                (Disconnected, Connecting)
                    | (Connecting, Online)
                    | (Online, Printing)
                    | (Printing, Paused | Stopping | Online)
                    | (Paused, Printing | Stopping)
                    | (Stopping, Online)
            ),
        }
    }

    /// Whether a connection is established in this state
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::Online | SessionState::Printing | SessionState::Paused | SessionState::Stopping
        )
    }

    /// Whether a job is active (printing or paused)
    pub fn has_active_job(&self) -> bool {
        matches!(self, SessionState::Printing | SessionState::Paused)
    }

    /// Whether lines may be transmitted in this state
    pub fn can_transmit(&self) -> bool {
        matches!(
            self,
            SessionState::Online | SessionState::Printing | SessionState::Paused
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Online => write!(f, "Online"),
            Self::Printing => write!(f, "Printing"),
            Self::Paused => write!(f, "Paused"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Errored => write!(f, "Errored"),
        }
    }
}

/// Hint about the response an instruction is expected to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseHint {
    /// Temperature reports until the acknowledgment (M105, M109, M190)
    Temperature,
}

impl ResponseHint {
    /// Hint implied by the command word of `text`
    pub fn for_command(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        match word.to_ascii_uppercase().as_str() {
            "M105" | "M109" | "M190" | "M191" => Some(Self::Temperature),
            _ => None,
        }
    }
}

/// A single instruction to send to the device
///
/// Immutable once created. The sequence number is assigned only when the
/// instruction is actually transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    text: String,
    expect: Option<ResponseHint>,
}

impl Instruction {
    /// Create a new instruction from its text
    ///
    /// The expected-response hint is derived from the command word.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let expect = ResponseHint::for_command(&text);
        Self { text, expect }
    }

    /// Override the expected-response hint
    pub fn expecting(mut self, hint: ResponseHint) -> Self {
        self.expect = Some(hint);
        self
    }

    /// The instruction text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The expected-response hint, if any
    pub fn expect(&self) -> Option<ResponseHint> {
        self.expect
    }
}

impl From<&str> for Instruction {
    fn from(text: &str) -> Self {
        Instruction::new(text)
    }
}

impl From<String> for Instruction {
    fn from(text: String) -> Self {
        Instruction::new(text)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Job progress as (acknowledged job lines, total job lines)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    /// Job-lane lines acknowledged by the device
    pub sent: usize,
    /// Total job-lane lines
    pub total: usize,
}

impl Progress {
    /// Create a progress value
    pub fn new(sent: usize, total: usize) -> Self {
        Self { sent, total }
    }

    /// Completion percentage in `0.0..=100.0`
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.sent as f64 / self.total as f64) * 100.0
    }

    /// Whether every job line has been acknowledged
    pub fn is_complete(&self) -> bool {
        self.sent >= self.total
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} = {:.1}%", self.sent, self.total, self.percent())
    }
}

/// One sensor entry of a temperature report, e.g. `T0:210.0 /215.0`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    /// Sensor name (`T`, `T0`, `B`, `C`, ...)
    pub sensor: String,
    /// Current temperature
    pub current: f64,
    /// Target temperature, when reported
    pub target: Option<f64>,
}

/// A parsed temperature report line
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TemperatureReport {
    /// All readings in line order
    pub readings: Vec<TemperatureReading>,
}

impl TemperatureReport {
    /// Look up a reading by sensor name
    pub fn get(&self, sensor: &str) -> Option<&TemperatureReading> {
        self.readings.iter().find(|r| r.sensor == sensor)
    }

    /// Whether the report holds no readings
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

impl fmt::Display for TemperatureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .readings
            .iter()
            .map(|r| match r.target {
                Some(target) => format!("{}:{:.1}/{:.1}", r.sensor, r.current, target),
                None => format!("{}:{:.1}", r.sensor, r.current),
            })
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}
