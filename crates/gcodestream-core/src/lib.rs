//! # gcodestream Core
//!
//! Core types, traits, and utilities for gcodestream.
//! Provides the session state model, the error taxonomy, instructions,
//! and the observer interfaces of the streaming engine.

pub mod core;
pub mod data;
pub mod error;
pub mod types;

pub use self::core::{EngineEvent, EngineListener, EngineListenerHandle, EventDispatcher, TimestampedEvent};

pub use data::{
    Instruction, Progress, ResponseHint, SessionState, TemperatureReading, TemperatureReport,
};

pub use error::{EngineError, Error, Result, TransportError};

pub use types::{
    thread_safe_rw, thread_safe_rw_map, thread_safe_vec, ThreadSafeRw, ThreadSafeRwMap,
    ThreadSafeVec,
};
