//! Streaming protocol building blocks
//!
//! - [`codec`]: wire line encoding and device line classification
//! - [`tracker`]: single in-flight line and resend handling
//! - [`queue`]: priority and job lanes
//! - [`session`]: session state transitions

pub mod codec;
pub mod queue;
pub mod session;
pub mod tracker;

pub use codec::{
    is_recoverable_error, strip_comment, ChecksumKind, ChecksumStrategy, LineCodec, NoChecksum,
    ProtocolEvent, WireLine, XorChecksum,
};
pub use queue::{Lane, QueuedLine, SendQueue};
pub use session::{SessionEvent, SessionMachine};
pub use tracker::{AckTracker, InFlightLine, TrackerOutcome};
