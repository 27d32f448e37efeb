//! Configuration for gcodestream
//!
//! Provides configuration file handling and validation.
//! Supports JSON and TOML file formats stored in the platform config
//! directory.
//!
//! Configuration is organized into two sections:
//! - Connection settings (port, baud rate, handshake and polling)
//! - Streaming settings (resend window, ack timeout, checksum, abort)

use crate::error::{ConfigError, SettingsError, SettingsResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Checksum appended to numbered lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumSetting {
    /// Running XOR of the line bytes
    #[default]
    Xor,
    /// No checksum
    None,
}

impl std::fmt::Display for ChecksumSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Xor => write!(f, "xor"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Last used port; empty when unset
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Time the device gets to answer before the link counts as settled
    pub handshake_timeout_ms: u64,
    /// Go online when the handshake timeout elapses instead of failing
    pub settle_on_timeout: bool,
    /// Longest single blocking read
    pub read_poll_ms: u64,
    /// Unnumbered command sent while connecting; empty disables probing
    pub probe_command: String,
    /// Interval between probe commands
    pub probe_interval_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115200,
            handshake_timeout_ms: 2000,
            settle_on_timeout: true,
            read_poll_ms: 50,
            probe_command: "M105".to_string(),
            probe_interval_ms: 1000,
        }
    }
}

/// Streaming protocol settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Retransmissions allowed per line
    pub resend_window: u32,
    /// Acknowledgment timeout in milliseconds
    pub ack_timeout_ms: u64,
    /// Checksum algorithm
    pub checksum: ChecksumSetting,
    /// Start every connection at line 0 with `M110`
    pub reset_line_numbers: bool,
    /// Command sent when a job is aborted; empty disables it
    pub halt_command: String,
    /// Firmware follows resend requests with a bare `ok`
    pub resend_trailing_ok: bool,
    /// `busy:` keepalives restart the ack timer
    pub busy_extends_timeout: bool,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            resend_window: 4,
            ack_timeout_ms: 30_000,
            checksum: ChecksumSetting::Xor,
            reset_line_numbers: true,
            halt_command: "M410".to_string(),
            resend_trailing_ok: true,
            busy_extends_timeout: true,
        }
    }
}

/// Complete application configuration
///
/// Aggregates all settings sections and provides file I/O operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Streaming settings
    pub streaming: StreamingSettings,
}

enum Format {
    Json,
    Toml,
}

fn format_of(path: &Path) -> SettingsResult<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(Format::Json),
        Some("toml") => Ok(Format::Toml),
        other => Err(ConfigError::UnsupportedFormat(other.unwrap_or("none").to_string()).into()),
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config location: `<config dir>/gcodestream/config.toml`
    pub fn default_path() -> SettingsResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("gcodestream").join("config.toml"))
            .ok_or_else(|| {
                SettingsError::ConfigDirectory("no configuration directory on this platform".into())
            })
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = format_of(path)?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::LoadError(format!("{}: {}", path.display(), e)))?;

        let config: Self = match format {
            Format::Json => serde_json::from_str(&content)?,
            Format::Toml => toml::from_str(&content)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file (JSON or TOML), creating parent directories
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match format_of(path)? {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Toml => toml::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| SettingsError::ConfigDirectory(format!("{}: {}", parent.display(), e)))?;
        }
        std::fs::write(path, content)
            .map_err(|e| SettingsError::SaveError(format!("{}: {}", path.display(), e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> SettingsResult<()> {
        if self.connection.baud_rate == 0 {
            return Err(SettingsError::invalid("connection.baud_rate", "must be > 0"));
        }

        if self.connection.handshake_timeout_ms == 0 {
            return Err(SettingsError::invalid(
                "connection.handshake_timeout_ms",
                "must be > 0",
            ));
        }

        if self.connection.read_poll_ms == 0 {
            return Err(SettingsError::invalid("connection.read_poll_ms", "must be > 0"));
        }

        if self.connection.probe_interval_ms == 0 {
            return Err(SettingsError::invalid(
                "connection.probe_interval_ms",
                "must be > 0",
            ));
        }

        if self.streaming.ack_timeout_ms == 0 {
            return Err(SettingsError::invalid("streaming.ack_timeout_ms", "must be > 0"));
        }

        if self.streaming.resend_window == 0 {
            return Err(ConfigError::ValueOutOfRange {
                key: "streaming.resend_window".to_string(),
                value: self.streaming.resend_window.to_string(),
            }
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.baud_rate, 115200);
        assert_eq!(config.streaming.resend_window, 4);
        assert_eq!(config.streaming.checksum, ChecksumSetting::Xor);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::new();
        config.connection.baud_rate = 0;
        assert!(matches!(
            config.validate(),
            Err(SettingsError::InvalidSetting { .. })
        ));

        let mut config = Config::new();
        config.streaming.resend_window = 0;
        assert!(matches!(
            config.validate(),
            Err(SettingsError::Config(ConfigError::ValueOutOfRange { .. }))
        ));

        let mut config = Config::new();
        config.streaming.ack_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.connection.probe_interval_ms = 0;
        match config.validate() {
            Err(SettingsError::InvalidSetting { key, .. }) => {
                assert_eq!(key, "connection.probe_interval_ms")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [streaming]
            resend_window = 7
            checksum = "none"
            "#,
        )
        .unwrap();
        assert_eq!(config.streaming.resend_window, 7);
        assert_eq!(config.streaming.checksum, ChecksumSetting::None);
        assert_eq!(config.streaming.ack_timeout_ms, 30_000);
        assert_eq!(config.connection, ConnectionSettings::default());
    }

    #[test]
    fn test_unsupported_extension() {
        let err = Config::new()
            .save_to_file(Path::new("config.yaml"))
            .unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Config(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_default_path_file_name() {
        if let Ok(path) = Config::default_path() {
            assert!(path.ends_with("gcodestream/config.toml"));
        }
    }
}
