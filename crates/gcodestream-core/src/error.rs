//! Error handling for gcodestream
//!
//! Provides the error taxonomy for every layer of the streaming engine:
//! - Transport errors (device unreachable, I/O failure)
//! - Engine errors (protocol violations, resend exhaustion, device errors,
//!   illegal control requests)
//!
//! All error types use `thiserror` for ergonomic error handling.

use crate::data::SessionState;
use thiserror::Error;

/// Transport error type
///
/// Represents failures of the byte-level channel to the device,
/// whatever the concrete transport is (serial port, socket, in-memory).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Failed to open the device
    #[error("Failed to open {path}: {reason}")]
    OpenFailed {
        /// The path or address that failed to open.
        path: String,
        /// The reason the open failed.
        reason: String,
    },

    /// Transport operation attempted before `open`
    #[error("Transport is not open")]
    NotOpen,

    /// The remote end closed the channel
    #[error("Transport closed: {reason}")]
    Closed {
        /// Why the channel closed.
        reason: String,
    },

    /// Read or write failure
    #[error("I/O error: {reason}")]
    Io {
        /// The reason for the I/O error.
        reason: String,
    },

    /// Baud rate not supported by the transport
    #[error("Baud rate {baud} not supported")]
    UnsupportedBaudRate {
        /// The unsupported baud rate.
        baud: u32,
    },
}

impl TransportError {
    /// Create an I/O error from any displayable reason
    pub fn io(reason: impl Into<String>) -> Self {
        TransportError::Io {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::io(err.to_string())
    }
}

/// Engine error type
///
/// Everything the streaming engine can report to a caller or observer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Caller misuse, e.g. submitting while a line is still in flight
    #[error("Protocol violation: {reason}")]
    ProtocolViolation {
        /// What the caller did wrong.
        reason: String,
    },

    /// A line was resent more often than the resend window allows
    #[error("Resend budget exhausted for line {sequence} after {attempts} attempts")]
    ResendExhausted {
        /// Sequence number of the failing line.
        sequence: u32,
        /// Number of transmissions made.
        attempts: u32,
    },

    /// The device sent an explicit error line
    #[error("Device reported error: {message}")]
    DeviceReportedError {
        /// The raw error text from the device.
        message: String,
    },

    /// The control request is illegal in the current session state
    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState {
        /// The rejected operation.
        operation: String,
        /// The state the session was in.
        state: SessionState,
    },

    /// No acknowledgment arrived in time
    #[error("No acknowledgment for line {sequence} after {timeout_ms}ms")]
    Timeout {
        /// Sequence number of the unacknowledged line.
        sequence: u32,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// A job was loaded while another one is still active
    #[error("A job is already active")]
    JobAlreadyActive,

    /// The engine loop has exited and can no longer accept requests
    #[error("Streaming engine is not running")]
    EngineStopped,
}

impl EngineError {
    /// Create a protocol violation error
    pub fn violation(reason: impl Into<String>) -> Self {
        EngineError::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error for an operation
    pub fn invalid_state(operation: impl Into<String>, state: SessionState) -> Self {
        EngineError::InvalidState {
            operation: operation.into(),
            state,
        }
    }

    /// Whether this error forces the session into `Errored`
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ResendExhausted { .. } | EngineError::DeviceReportedError { .. }
        )
    }
}

/// Main error type for gcodestream
///
/// A unified error type that can represent any error from all layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Engine error
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Engine(EngineError::Transport(err))
    }
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a transport error
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Engine(EngineError::Transport(_)) | Error::Io(_))
    }

    /// Check if this error is fatal for the connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Engine(e) if e.is_fatal())
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
