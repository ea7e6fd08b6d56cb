//! surface-host: control-surface automation host
//!
//! Entry point for the surface-host binary. Parses the command line, loads
//! configuration, sets up logging and the audit trail, and runs either a
//! subcommand or the host itself.
//!
//! # I/O Architecture
//!
//! - **Diagnostic logging**: `tracing` output on stderr, filtered by `-v`,
//!   `RUST_LOG` or `general.log_level`
//! - **Audit logging**: connection lifecycle events go to syslog, never to
//!   stdout/stderr
//! - **Connection output**: stdout/stderr of connection processes is read by
//!   the supervisor and re-logged with the connection id

use anyhow::{Context, Result};
use clap::Parser;
use surface_host::{
    cli::{Cli, Commands},
    cli_handler::handle_command,
    config::ConfigLoader,
    orchestrator, telemetry,
};
use tracing::{debug, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = &cli.command {
        let fallback = match command {
            Commands::InternalEcho => "info",
            Commands::CheckConfig => "warn",
        };
        init_tracing(cli.verbose, fallback)?;
        return handle_command(command, &cli);
    }

    let config = ConfigLoader::new()
        .context("Failed to locate configuration")?
        .load(&cli)
        .context("Failed to load configuration")?;

    let fallback = if config.general.log_level.is_empty() {
        "warn"
    } else {
        config.general.log_level.as_str()
    };
    init_tracing(cli.verbose, fallback)?;
    debug!("Loaded configuration: {:?}", config);

    // Syslog is optional; audit events are dropped when it is unreachable.
    if let Err(e) = telemetry::init_logger() {
        warn!("Audit logging disabled: {}", e);
        let _ = telemetry::init_null_logger();
    }

    orchestrator::run_host(&config)
}

/// Initialize the tracing subscriber for diagnostic logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else `fallback`
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, fallback: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
