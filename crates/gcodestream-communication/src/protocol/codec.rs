//! Line Codec
//!
//! Formats outgoing instructions into numbered, checksummed wire lines and
//! classifies incoming device output into protocol events.
//!
//! Wire format of a numbered line:
//!
//! ```text
//! N<sequence> <payload>*<checksum>
//! ```
//!
//! The checksum covers `N<sequence> <payload>` and is produced by a pluggable
//! [`ChecksumStrategy`]. Decoding is permissive: anything the codec does not
//! understand becomes [`ProtocolEvent::Unrecognized`].

use gcodestream_core::{Instruction, TemperatureReading, TemperatureReport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Checksum algorithm applied to numbered lines
pub trait ChecksumStrategy: Send + Sync + fmt::Debug {
    /// Short name used in logs and configuration
    fn name(&self) -> &'static str;

    /// Checksum of `data`, or `None` if this strategy appends no checksum
    fn checksum(&self, data: &[u8]) -> Option<u8>;
}

/// Running exclusive-or of every byte (the reprap line checksum)
#[derive(Debug, Clone, Copy, Default)]
pub struct XorChecksum;

impl ChecksumStrategy for XorChecksum {
    fn name(&self) -> &'static str {
        "xor"
    }

    fn checksum(&self, data: &[u8]) -> Option<u8> {
        Some(data.iter().fold(0u8, |acc, b| acc ^ b))
    }
}

/// Numbered lines without a checksum suffix
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChecksum;

impl ChecksumStrategy for NoChecksum {
    fn name(&self) -> &'static str {
        "none"
    }

    fn checksum(&self, _data: &[u8]) -> Option<u8> {
        None
    }
}

/// Checksum selection as it appears in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// [`XorChecksum`]
    #[default]
    Xor,
    /// [`NoChecksum`]
    None,
}

impl ChecksumKind {
    /// Build the strategy for this kind
    pub fn strategy(&self) -> Arc<dyn ChecksumStrategy> {
        match self {
            ChecksumKind::Xor => Arc::new(XorChecksum),
            ChecksumKind::None => Arc::new(NoChecksum),
        }
    }
}

impl std::str::FromStr for ChecksumKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xor" => Ok(ChecksumKind::Xor),
            "none" => Ok(ChecksumKind::None),
            other => Err(format!("unknown checksum algorithm '{}'", other)),
        }
    }
}

/// An instruction encoded for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireLine {
    /// Sequence number assigned at transmission time
    pub sequence: u32,
    /// Cleaned instruction text
    pub payload: String,
    /// Checksum over `N<sequence> <payload>`, if the strategy produces one
    pub checksum: Option<u8>,
    /// Exact bytes written to the transport, without the line terminator
    pub raw: Vec<u8>,
}

impl WireLine {
    /// The raw line as text
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

impl fmt::Display for WireLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

/// A classified line of device output
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Acknowledgment; numbered when the firmware reports the line number
    Ack(Option<u32>),
    /// The device asks for a line to be sent again
    ResendRequest(u32),
    /// Explicit error line
    Error(String),
    /// Temperature report without an acknowledgment
    TemperatureReport(TemperatureReport),
    /// Firmware keepalive (`busy:`, `echo:busy:`, `wait`)
    Busy(String),
    /// Anything else
    Unrecognized(String),
}

/// Encoder/decoder for the numbered line protocol
#[derive(Debug, Clone)]
pub struct LineCodec {
    checksum: Arc<dyn ChecksumStrategy>,
}

impl LineCodec {
    /// Create a codec using the given checksum strategy
    pub fn new(checksum: Arc<dyn ChecksumStrategy>) -> Self {
        Self { checksum }
    }

    /// Name of the active checksum strategy
    pub fn checksum_name(&self) -> &'static str {
        self.checksum.name()
    }

    /// Encode an instruction under the given sequence number
    ///
    /// Comments are stripped and whitespace trimmed before encoding, so the
    /// same instruction text always produces the same bytes.
    pub fn encode(&self, sequence: u32, instruction: &Instruction) -> WireLine {
        let payload = strip_comment(instruction.text());
        let body = format!("N{} {}", sequence, payload);
        let checksum = self.checksum.checksum(body.as_bytes());
        let raw = match checksum {
            Some(sum) => format!("{}*{}", body, sum),
            None => body,
        };

        WireLine {
            sequence,
            payload,
            checksum,
            raw: raw.into_bytes(),
        }
    }

    /// Parse a numbered wire line back into its parts
    ///
    /// Returns `None` if the line is not numbered or its checksum does not
    /// match the active strategy.
    pub fn parse_wire(&self, raw: &str) -> Option<WireLine> {
        let raw = raw.trim();
        let (body, checksum) = match raw.rsplit_once('*') {
            Some((body, sum)) => (body, Some(sum.trim().parse::<u8>().ok()?)),
            None => (raw, None),
        };

        if self.checksum.checksum(body.as_bytes()) != checksum {
            return None;
        }

        let rest = body.strip_prefix('N')?;
        let (number, payload) = rest.split_once(' ').unwrap_or((rest, ""));
        let sequence = number.parse::<u32>().ok()?;

        Some(WireLine {
            sequence,
            payload: payload.to_string(),
            checksum,
            raw: raw.as_bytes().to_vec(),
        })
    }

    /// Classify one line of device output. Never fails.
    pub fn decode(&self, raw: &str) -> ProtocolEvent {
        let line = raw.trim();
        let lower = line.to_ascii_lowercase();

        if lower == "ok" || lower.starts_with("ok ") || lower.starts_with("ok:") {
            return ProtocolEvent::Ack(parse_ack_number(&line[2..]));
        }

        if let Some(rest) = strip_prefix_ci(line, "resend") {
            return match parse_line_number(rest) {
                Some(n) => ProtocolEvent::ResendRequest(n),
                None => ProtocolEvent::Unrecognized(line.to_string()),
            };
        }

        if lower.starts_with("rs ") || lower.starts_with("rs:") {
            return match parse_line_number(&line[2..]) {
                Some(n) => ProtocolEvent::ResendRequest(n),
                None => ProtocolEvent::Unrecognized(line.to_string()),
            };
        }

        if let Some(rest) = strip_prefix_ci(line, "error") {
            let message = rest.trim_start_matches(':').trim();
            return ProtocolEvent::Error(if message.is_empty() {
                line.to_string()
            } else {
                message.to_string()
            });
        }

        if let Some(rest) = line.strip_prefix("!!") {
            return ProtocolEvent::Error(rest.trim().to_string());
        }

        let keepalive = lower
            .strip_prefix("echo:")
            .map(str::trim_start)
            .unwrap_or(lower.as_str());
        if keepalive.starts_with("busy:") || keepalive == "wait" {
            return ProtocolEvent::Busy(line.to_string());
        }

        if let Some(report) = parse_temperature(line) {
            return ProtocolEvent::TemperatureReport(report);
        }

        ProtocolEvent::Unrecognized(line.to_string())
    }

    /// Temperature readings carried by a line, including ones piggybacked
    /// on an acknowledgment (`ok T:20.1 /0.0`)
    pub fn temperature_in(&self, raw: &str) -> Option<TemperatureReport> {
        parse_temperature(raw.trim())
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(Arc::new(XorChecksum))
    }
}

/// Whether a device error message describes a line transport fault that the
/// firmware follows with a resend request
pub fn is_recoverable_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["checksum", "line number", "last line", "format error"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Remove `;` comments and `( )` comments, then trim
pub fn strip_comment(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;

    for c in line.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }

    out.trim().to_string()
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    match line.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => line.get(prefix.len()..),
        _ => None,
    }
}

/// Parse `5`, `N5`, `:5`, `: N5` into a line number
fn parse_line_number(text: &str) -> Option<u32> {
    let trimmed = text
        .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
        .trim_start_matches(['N', 'n']);
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// The line number in `ok N5 P15 B3` or `ok 5`; `None` for a bare ok
fn parse_ack_number(rest: &str) -> Option<u32> {
    let first = rest
        .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
        .split_whitespace()
        .next()?;
    let number = first.strip_prefix(['N', 'n']).unwrap_or(first);
    number.parse().ok()
}

fn parse_temperature(line: &str) -> Option<TemperatureReport> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if !tokens.iter().any(|t| t.starts_with('T') && t.contains(':')) {
        return None;
    }

    let mut readings = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        i += 1;

        let Some((sensor, value)) = token.split_once(':') else {
            continue;
        };
        if !is_sensor_name(sensor) {
            continue;
        }

        let (current, inline_target) = match value.split_once('/') {
            Some((cur, tgt)) => (cur, Some(tgt)),
            None => (value, None),
        };
        let Ok(current) = current.parse::<f64>() else {
            continue;
        };

        let target = match inline_target {
            Some(tgt) => tgt.parse::<f64>().ok(),
            None => match tokens.get(i).and_then(|t| t.strip_prefix('/')) {
                Some(tgt) => {
                    i += 1;
                    tgt.parse::<f64>().ok()
                }
                None => None,
            },
        };

        readings.push(TemperatureReading {
            sensor: sensor.to_string(),
            current,
            target,
        });
    }

    if readings.is_empty() {
        None
    } else {
        Some(TemperatureReport { readings })
    }
}

fn is_sensor_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some('T' | 'B' | 'C' | 'P' | 'L' | 'R') => chars.all(|c| c.is_ascii_digit()),
        _ => false,
    }
}
