pub mod config;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use nb_domain::config::Config;

/// NodeBridge: lets a gateway drive commands on paired remote nodes.
#[derive(Debug, Parser)]
#[command(name = "nodebridge", version, about)]
pub struct Cli {
    /// Path to the config file.
    #[arg(long, global = true, env = "NB_CONFIG", default_value = "nodebridge.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from `path`.  A missing file yields the defaults.
///
/// Shared by `serve` and the `config` subcommands.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("loading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["nodebridge"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_config_subcommands() {
        let cli = Cli::try_parse_from(["nodebridge", "--config", "x.toml", "config", "validate"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert!(matches!(cli.command, Some(Command::Config(ConfigCommand::Validate))));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.bridge.port, 18790);
    }

    #[test]
    fn loads_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodebridge.toml");
        std::fs::write(&path, "[bridge]\nbind = \"loopback\"\nport = 19000\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.bridge.port, 19000);
        assert_eq!(config.bridge.resolve_bind_host().as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[bridge\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }
}
