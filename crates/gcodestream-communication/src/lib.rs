//! # gcodestream Communication
//!
//! Transports and the streaming protocol engine for gcodestream.
//! Encodes numbered, checksummed G-code lines, keeps exactly one line in
//! flight, recovers from resend requests and timeouts, and exposes the
//! pause/resume/abort control surface of a print session.

pub mod communication;
pub mod engine;
pub mod job;
pub mod protocol;

pub use communication::{
    memory::{MemoryDevice, MemoryTransport, Responder},
    serial::{is_device_port, list_ports, SerialPortInfo, SerialTransport},
    ConnectionParams, SerialParity, Transport,
};

pub use engine::{Command, Engine, EngineConfig, EngineSnapshot, StreamingEngine};

pub use job::{GcodeFile, InstructionList, JobSource};

pub use protocol::{
    AckTracker, ChecksumKind, ChecksumStrategy, InFlightLine, Lane, LineCodec, NoChecksum,
    ProtocolEvent, QueuedLine, SendQueue, SessionEvent, SessionMachine, TrackerOutcome,
    WireLine, XorChecksum,
};
