//! Command-line argument parsing for the gamelink client tools.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

const APP_NAME: &str = "gamelink";

/// gamelink command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "gamelink-probe", about = "Probe gamelink backend services")]
pub struct CliArgs {
    /// Gatekeeper server address (replaces the configured list).
    #[arg(long)]
    pub gatekeeper: Option<String>,

    /// Auth server address (replaces the configured list).
    #[arg(long)]
    pub auth: Option<String>,

    /// Game server address (replaces the configured list).
    #[arg(long)]
    pub game: Option<String>,

    /// Default server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Default transaction timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Disable keep-alive pings.
    #[arg(long)]
    pub no_ping: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// Directory holding `config.ron`: `--config` if given, otherwise the
    /// platform configuration directory.
    pub fn config_dir(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| dirs::config_dir().map(|base| base.join(APP_NAME)))
    }
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.gatekeeper {
            self.servers.gatekeeper = vec![addr.clone()];
        }
        if let Some(ref addr) = args.auth {
            self.servers.auth = vec![addr.clone()];
        }
        if let Some(ref addr) = args.game {
            self.servers.game = vec![addr.clone()];
        }
        if let Some(port) = args.port {
            self.servers.port = port;
        }
        if let Some(ms) = args.timeout_ms {
            self.transactions.default_timeout_ms = ms;
        }
        if args.no_ping {
            self.connection.ping_enabled = false;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
