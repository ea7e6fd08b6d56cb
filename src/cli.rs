//! Command-line interface definitions for surface-host.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Control-surface automation host.
///
/// Runs every configured connection as a supervised child process, talks to
/// each over a framed JSON channel, and executes the actions and feedbacks
/// bound to controls.
#[derive(Parser, Debug)]
#[command(name = "surface-host")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run (or omit to run the host).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Socket connection processes dial, overriding `host.socket_path`.
    #[arg(long = "socket", value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Do not start the HTTP bridge.
    #[arg(long = "no-http")]
    pub no_http: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for surface-host.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load and validate configuration, then print a summary.
    #[command(name = "check-config")]
    CheckConfig,

    /// Reference connection process (hidden).
    ///
    /// Reads its connection id, channel address and token from the
    /// environment, registers with the host and answers every verb. It is
    /// spawned by the host, not invoked directly.
    #[command(name = "internal-echo", hide = true)]
    InternalEcho,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_basic() {
        let cli = Cli::parse_from(["surface-host"]);
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
        assert!(!cli.no_http);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_parse_with_options() {
        let cli = Cli::parse_from([
            "surface-host",
            "-c",
            "/etc/extra.toml",
            "--socket",
            "/tmp/host.sock",
            "--no-http",
            "-vv",
        ]);

        assert_eq!(cli.config, Some(PathBuf::from("/etc/extra.toml")));
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/host.sock")));
        assert!(cli.no_http);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_check_config_command() {
        let cli = Cli::parse_from(["surface-host", "check-config", "-c", "/tmp/a.toml"]);
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/a.toml")));
    }

    #[test]
    fn test_internal_echo_command() {
        let cli = Cli::parse_from(["surface-host", "internal-echo"]);
        assert!(matches!(cli.command, Some(Commands::InternalEcho)));
    }
}
