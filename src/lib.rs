//! # gcodestream
//!
//! Streams G-code files to printers and other line-numbered G-code devices
//! over a serial link, keeping exactly one line in flight and recovering
//! from resend requests and dropped lines.
//!
//! ## Architecture
//!
//! gcodestream is organized as a workspace with multiple crates:
//!
//! 1. **gcodestream-core** - Session state, instructions, errors, events
//! 2. **gcodestream-communication** - Transports, line codec, ack tracker,
//!    send queue, session state machine and the engine loop
//! 3. **gcodestream-settings** - Configuration file handling
//! 4. **gcodestream** - Logging setup and the command-line front end

pub use gcodestream_communication::{
    list_ports, ChecksumKind, ConnectionParams, EngineConfig, GcodeFile, InstructionList,
    JobSource, MemoryDevice, MemoryTransport, SerialPortInfo, SerialTransport, StreamingEngine,
    Transport,
};

pub use gcodestream_core::{
    EngineError, EngineEvent, EngineListener, EngineListenerHandle, Error, Instruction, Progress,
    Result, SessionState, TemperatureReport,
};

pub use gcodestream_settings::{ChecksumSetting, Config, SettingsError};

use std::time::Duration;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging
///
/// Sets up structured logging with:
/// - Output on stderr, so progress lines on stdout stay readable
/// - RUST_LOG environment variable support
/// - `info` by default, `debug` (wire traffic) when `verbose`
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Engine tunables from a loaded configuration
pub fn engine_config_from(config: &Config) -> EngineConfig {
    let connection = &config.connection;
    let streaming = &config.streaming;

    EngineConfig {
        resend_window: streaming.resend_window,
        ack_timeout: Duration::from_millis(streaming.ack_timeout_ms),
        handshake_timeout: Duration::from_millis(connection.handshake_timeout_ms),
        settle_on_timeout: connection.settle_on_timeout,
        read_poll: Duration::from_millis(connection.read_poll_ms),
        probe_command: non_empty(&connection.probe_command),
        probe_interval: Duration::from_millis(connection.probe_interval_ms),
        checksum: match streaming.checksum {
            ChecksumSetting::Xor => ChecksumKind::Xor,
            ChecksumSetting::None => ChecksumKind::None,
        },
        reset_line_numbers: streaming.reset_line_numbers,
        halt_command: non_empty(&streaming.halt_command),
        resend_trailing_ok: streaming.resend_trailing_ok,
        busy_extends_timeout: streaming.busy_extends_timeout,
        ..EngineConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_engine_defaults() {
        assert_eq!(engine_config_from(&Config::default()), EngineConfig::default());
    }

    #[test]
    fn test_empty_commands_disable_probe_and_halt() {
        let mut config = Config::default();
        config.connection.probe_command = "  ".to_string();
        config.streaming.halt_command = String::new();
        config.streaming.checksum = ChecksumSetting::None;
        config.streaming.ack_timeout_ms = 1500;

        let engine = engine_config_from(&config);
        assert_eq!(engine.probe_command, None);
        assert_eq!(engine.halt_command, None);
        assert_eq!(engine.checksum, ChecksumKind::None);
        assert_eq!(engine.ack_timeout, Duration::from_millis(1500));
    }
}
