//! gcodestream Settings Crate
//!
//! Handles the configuration file of the streaming engine: connection and
//! streaming sections, validation, and the default file location.

pub mod config;
pub mod error;

pub use config::{ChecksumSetting, Config, ConnectionSettings, StreamingSettings};
pub use error::{ConfigError, SettingsError, SettingsResult};
