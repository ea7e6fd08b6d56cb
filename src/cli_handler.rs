//! Subcommand handling for surface-host.
//!
//! Covers the lightweight subcommands: configuration checks and the hidden
//! reference connection process.

use anyhow::{Context, Result};

use crate::cli::{Cli, Commands};
use crate::config::{Config, ConfigLoader};
use crate::echo;

/// Handle a subcommand.
pub fn handle_command(command: &Commands, cli: &Cli) -> Result<()> {
    match command {
        Commands::CheckConfig => check_config(cli),
        Commands::InternalEcho => run_echo(),
    }
}

/// Load, validate and summarize configuration.
fn check_config(cli: &Cli) -> Result<()> {
    let loader = ConfigLoader::new().context("Failed to locate configuration")?;
    let config = loader.load(cli).context("Failed to load configuration")?;
    config.host_config().context("Invalid host configuration")?;
    print!("{}", summarize(&config));
    Ok(())
}

/// Human-readable summary of a loaded configuration.
pub fn summarize(config: &Config) -> String {
    let mut out = String::new();
    out.push_str(&format!("API versions: {}\n", config.host.api_version));
    if config.http.is_enabled() {
        out.push_str(&format!("HTTP bridge: {}\n", config.http.listen));
    } else {
        out.push_str("HTTP bridge: disabled\n");
    }
    out.push_str(&format!("Pages: {}\n", config.pages.count));

    let mut modules: Vec<_> = config.modules.keys().collect();
    modules.sort();
    out.push_str(&format!("Modules ({}):\n", modules.len()));
    for id in modules {
        out.push_str(&format!("  {}\n", id));
    }

    out.push_str(&format!("Connections ({}):\n", config.connections.len()));
    for connection in &config.connections {
        out.push_str(&format!(
            "  {} [{}] type={}{}\n",
            connection.id,
            connection.label,
            connection.instance_type,
            if connection.enabled { "" } else { " (disabled)" }
        ));
    }

    for connection in config.connections_without_module() {
        out.push_str(&format!(
            "warning: connection '{}' uses unknown type '{}'\n",
            connection.id, connection.instance_type
        ));
    }
    out
}

/// Run the reference connection process.
fn run_echo() -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async { echo::run().await.map_err(|e| anyhow::anyhow!(e)) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_flags_unknown_modules() {
        let config: Config = toml::from_str(
            r#"
[modules.echo]
command = "surface-host"
args = ["internal-echo"]

[[connections]]
id = "echo-1"
label = "echo"
instance_type = "echo"

[[connections]]
id = "gone-1"
label = "gone"
instance_type = "missing"
enabled = false
"#,
        )
        .unwrap();

        let summary = summarize(&config);
        assert!(summary.contains("echo-1 [echo] type=echo\n"));
        assert!(summary.contains("gone-1 [gone] type=missing (disabled)"));
        assert!(summary.contains("warning: connection 'gone-1' uses unknown type 'missing'"));
        assert!(!summary.contains("warning: connection 'echo-1'"));
    }
}
