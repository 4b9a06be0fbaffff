//! mqtt2osc - MQTT <-> OSC relay
//!
//! Usage:
//!   mqtt2osc [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: mqtt2osc.toml)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   --node-id <N>          Sender id stamped into outgoing pings
//!   -h, --help             Print help

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mqtt2osc::config::Config;
use mqtt2osc::Bridge;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// mqtt2osc - Bidirectional MQTT <-> OSC relay
#[derive(Parser, Debug)]
#[command(name = "mqtt2osc")]
#[command(author = "mqtt2osc Contributors")]
#[command(version)]
#[command(about = "Relay MQTT broker messages to OSC and back")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, default_value = "mqtt2osc.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Sender id for outgoing pings (default: derived from hostname)
    #[arg(long)]
    node_id: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!(
                "Error loading config file {}: {}",
                args.config.display(),
                e
            );
            std::process::exit(1);
        }
    };

    // CLI overrides config; RUST_LOG overrides both
    let level = args
        .log_level
        .map(|l| l.as_str().to_string())
        .unwrap_or_else(|| config.log.level.to_lowercase());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(node_id) = args.node_id {
        config.relay.node_id = Some(node_id);
    }
    let stop_timeout = config.relay.stop_timeout;

    info!(
        "mqtt2osc {} relaying {}:{} <-> {}",
        env!("CARGO_PKG_VERSION"),
        config.broker.address,
        config.broker.port,
        config.local.listen_addr()
    );

    let bridge = Bridge::with_default_handler(config);
    if let Err(e) = bridge.start().await {
        error!("Failed to start relay: {}", e);
        std::process::exit(1);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = bridge.wait() => {}
    }

    bridge.stop();
    if !bridge.join(stop_timeout).await {
        error!("Relay did not stop within {:?}", stop_timeout);
    }

    if let Some(e) = bridge.take_failure() {
        error!("Relay terminated: {}", e);
        std::process::exit(1);
    }

    info!("bye");
    Ok(())
}
