//! Transports
//!
//! The engine only depends on the line-oriented [`Transport`] contract.
//! [`serial::SerialTransport`] talks to a real device,
//! [`memory::MemoryTransport`] is an in-process fake device.

pub mod memory;
pub mod serial;

use gcodestream_core::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Parameters used to open a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Device path or port name (e.g. `/dev/ttyUSB0`, `COM3`)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Hardware flow control
    pub flow_control: bool,
}

impl ConnectionParams {
    /// Parameters for `port` at `baud_rate` with 8N1 framing
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ..Default::default()
        }
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115200,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: false,
        }
    }
}

/// Line-oriented duplex channel to a device
///
/// Implementations may fail at any time; the engine reacts to every error.
pub trait Transport: Send {
    /// Open the channel
    fn open(&mut self, params: &ConnectionParams) -> Result<(), TransportError>;

    /// Write one line; the implementation appends the line terminator
    fn write_line(&mut self, line: &[u8]) -> Result<(), TransportError>;

    /// Read one line without its terminator
    ///
    /// Returns `Ok(None)` when nothing complete arrived within `timeout`,
    /// so the caller can service other work between reads.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError>;

    /// Close the channel; closing a closed transport is a no-op
    fn close(&mut self);

    /// Whether the channel is open
    fn is_open(&self) -> bool;

    /// Human readable name for logs
    fn name(&self) -> &str;
}
