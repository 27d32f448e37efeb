//! gcodestream - stream a G-code file to a serial device
//!
//! `gcodestream [OPTIONS] PORT FILE`

use anyhow::{bail, Context};
use clap::Parser;
use gcodestream::{
    engine_config_from, init_logging, Config, ConnectionParams, EngineEvent, GcodeFile, JobSource,
    Progress, SerialTransport, SessionState, StreamingEngine, BUILD_DATE, VERSION,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Extra time on top of the handshake timeout before giving up on the device
const CONNECT_GRACE: Duration = Duration::from_secs(5);

/// How long an aborted job waits for the halt command to be acknowledged
const HALT_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(
    name = "gcodestream",
    version,
    about = "Stream a G-code file to a printer over a serial port"
)]
struct Cli {
    /// Serial port of the device, e.g. /dev/ttyUSB0
    port: String,

    /// G-code file to print
    file: PathBuf,

    /// Baud rate (overrides the config file)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Print progress while the job runs
    #[arg(short, long)]
    statusreport: bool,

    /// Log every line sent and received
    #[arg(short, long)]
    verbose: bool,

    /// Config file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => match Config::default_path() {
            Ok(path) => Config::load_or_default(&path)
                .with_context(|| format!("loading config {}", path.display()))?,
            Err(_) => Config::default(),
        },
    };

    if let Some(baud) = cli.baud {
        if baud == 0 {
            bail!("invalid baud rate: {}", baud);
        }
        config.connection.baud_rate = baud;
    }
    config.connection.port = cli.port.clone();

    Ok(config)
}

fn report(progress: &Progress) {
    print!("\rProgress: {}", progress);
    let _ = std::io::stdout().flush();
}

async fn stream(engine: &StreamingEngine, cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let source = GcodeFile::open(&cli.file)
        .with_context(|| format!("opening {}", cli.file.display()))?;
    let instructions = source
        .load()
        .with_context(|| format!("reading {}", cli.file.display()))?;

    println!(
        "Printing: {} on {} with baudrate {}",
        cli.file.display(),
        config.connection.port,
        config.connection.baud_rate
    );

    let mut events = engine.subscribe();
    engine
        .connect_with(ConnectionParams::new(
            config.connection.port.clone(),
            config.connection.baud_rate,
        ))
        .await
        .with_context(|| format!("connecting to {}", config.connection.port))?;

    let settle = Duration::from_millis(config.connection.handshake_timeout_ms) + CONNECT_GRACE;
    if !engine.wait_for_state(SessionState::Online, settle).await {
        bail!(
            "device on {} did not come online (state: {})",
            config.connection.port,
            engine.state()
        );
    }

    let total = engine.start_job(instructions).await?;
    tracing::info!("Streaming {} lines from {}", total, source.name());
    if total == 0 {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, aborting job");
                let interrupted_at = engine.progress();
                engine.abort().await?;
                if !engine.wait_until_idle(HALT_GRACE).await {
                    tracing::warn!("Device did not acknowledge the halt command");
                }
                bail!("interrupted at {}", interrupted_at);
            }
            received = events.recv() => match received {
                Ok(stamped) => match stamped.event {
                    EngineEvent::Progress(progress) if cli.statusreport => report(&progress),
                    EngineEvent::JobComplete(progress) => {
                        if cli.statusreport {
                            report(&progress);
                            println!();
                        }
                        return Ok(());
                    }
                    EngineEvent::Fatal(reason) => bail!("print failed: {}", reason),
                    EngineEvent::StateChanged(SessionState::Disconnected) => {
                        bail!("device disconnected at {}", engine.progress())
                    }
                    EngineEvent::Message(message) => tracing::debug!("{}", message),
                    _ => {}
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} events", skipped);
                }
                Err(RecvError::Closed) => bail!("engine stopped unexpectedly"),
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    tracing::debug!("gcodestream {} (built {})", VERSION, BUILD_DATE);

    let config = load_config(&cli)?;
    let engine = StreamingEngine::spawn(
        Box::new(SerialTransport::new()),
        engine_config_from(&config),
    );

    let outcome = stream(&engine, &cli, &config).await;

    if let Err(e) = engine.disconnect().await {
        tracing::warn!("Disconnect failed: {}", e);
    }
    engine.shutdown().await?;

    outcome
}
