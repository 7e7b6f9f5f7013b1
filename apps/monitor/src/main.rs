//! # Dunebugger Monitor
//!
//! Runs one monitor session against the configured pub/sub endpoint and logs
//! what the device reports.
//!
//! ## Usage
//! ```bash
//! # Endpoint from the environment, everything else from defaults
//! DUNEBUGGER_WSS_URL="wss://..." cargo run -p dunebugger-monitor
//!
//! # Explicit config file
//! cargo run -p dunebugger-monitor -- --config ./monitor.toml
//!
//! # Write the effective configuration to a file and exit
//! cargo run -p dunebugger-monitor -- --config ./monitor.toml --write-config
//! ```
//!
//! ## Startup Sequence
//! 1. Initialize tracing (`RUST_LOG` overrides the default filter)
//! 2. Load configuration (defaults → file → environment)
//! 3. Spawn the session with the WebSocket connector
//! 4. Log store changes and session status until Ctrl+C
//!
//! Configuration errors exit with status 2, other startup failures with 1.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dunebugger_core::StoreChange;
use dunebugger_sync::{
    MonitorConfig, MonitorError, MonitorResult, SessionBuilder, SessionEventEmitter, SessionState,
    SessionStatus, WsConnector,
};

/// Exit status for configuration problems.
const EXIT_CONFIG: u8 = 2;

/// Logs session status through `tracing`.
struct TracingEmitter;

impl SessionEventEmitter for TracingEmitter {
    fn emit_status(&self, status: &SessionStatus) {
        match status.state {
            SessionState::Backoff => info!(
                state = %status.state,
                retry_count = status.retry_count,
                next_retry_in = ?status.next_retry_in,
                "Session status"
            ),
            _ => info!(
                state = %status.state,
                connection_id = ?status.connection_id,
                device_online = status.is_device_online,
                "Session status"
            ),
        }
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        if retryable {
            warn!(%message, "Session error");
        } else {
            error!(%message, "Session failed, no further reconnects");
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dunebugger=debug"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Maps a startup failure to the process exit status.
fn exit_status(err: &MonitorError) -> u8 {
    if err.is_config_error() {
        EXIT_CONFIG
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Monitor failed");
            ExitCode::from(exit_status(&e))
        }
    }
}

async fn run() -> MonitorResult<()> {
    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut write_config = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--write-config" => write_config = true,
            "--help" | "-h" => {
                println!("Dunebugger Monitor");
                println!();
                println!("Usage: dunebugger-monitor [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>  Config file (default: platform config dir/monitor.toml)");
                println!("      --write-config   Write the effective config to the config file and exit");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            other => warn!(arg = %other, "Ignoring unknown argument"),
        }
        i += 1;
    }

    let config = MonitorConfig::load(config_path.clone())?;
    info!(
        group = %config.group(),
        device_id = %config.device_id(),
        retry_policy = %config.retry.policy,
        max_attempts = config.retry.max_attempts,
        "Configuration loaded"
    );

    if write_config {
        config.save(config_path)?;
        return Ok(());
    }

    let connector = WsConnector::new(config.transport_settings());
    let session = SessionBuilder::new(config)
        .with_emitter(Arc::new(TracingEmitter))
        .spawn(connector)?;

    session.subscribe(|change, store| match change {
        StoreChange::InitialState {
            gpio_count,
            log_count,
        } => info!(gpio_count, log_count, revision = store.revision(), "Initial state"),
        StoreChange::GpioUpdated {
            gpio,
            value,
            previous,
        } => info!(%gpio, %value, previous = ?previous, "GPIO update"),
        StoreChange::LogAppended { line } => info!(target: "dunebugger::device", "{}", line),
    });

    session.connect().await?;

    shutdown_signal().await;

    session.shutdown().await?;
    let snapshot = session.snapshot();
    info!(
        gpio_count = snapshot.gpio.len(),
        log_lines = snapshot.logs.len(),
        "Monitor stopped"
    );

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
