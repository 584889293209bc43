//! # CLI Interface
//!
//! Defines the command-line argument structure for `tally-node` using
//! `clap` derive. One binary runs either side of the system: `device` for
//! a wallet's local server and peer listener, `authority` for the central
//! ledger. `init` prepares a device data directory and `version` prints
//! build information.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tally_ledger::config::{
    AUTO_SYNC_INTERVAL, DEFAULT_AUTHORITY_PORT, DEFAULT_DEVICE_PORT, DEFAULT_PEER_PORT,
};

use crate::logging::LogFormat;

/// Tally offline payment node.
///
/// Devices pay each other without a network connection to the authority,
/// keep their own ledgers, and reconcile whenever the authority is
/// reachable.
#[derive(Parser, Debug)]
#[command(
    name = "tally-node",
    about = "Tally offline payment node",
    version,
    propagate_version = true
)]
pub struct TallyNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the Tally node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a device: local HTTP API, peer listener and background sync.
    Device(DeviceArgs),
    /// Run the central authority that devices sync against.
    Authority(AuthorityArgs),
    /// Create a device data directory and assign it a fresh device id.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `device` subcommand.
#[derive(Parser, Debug)]
pub struct DeviceArgs {
    /// Directory holding the ledger and the device id file.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "TALLY_DATA_DIR", default_value = "./tally-data")]
    pub data_dir: PathBuf,

    /// Device id to use instead of the one stored in the data directory.
    #[arg(long, env = "TALLY_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Port for the local HTTP API.
    #[arg(long, env = "TALLY_HTTP_PORT", default_value_t = DEFAULT_DEVICE_PORT)]
    pub http_port: u16,

    /// Port peers connect to for payments.
    #[arg(long, env = "TALLY_PEER_PORT", default_value_t = DEFAULT_PEER_PORT)]
    pub peer_port: u16,

    /// Base URL of the authority.
    #[arg(long, env = "TALLY_AUTHORITY_URL", default_value = "http://127.0.0.1:3000")]
    pub authority_url: String,

    /// Seconds between background sync runs.
    #[arg(long, env = "TALLY_SYNC_INTERVAL_SECS", default_value_t = AUTO_SYNC_INTERVAL.as_secs())]
    pub sync_interval_secs: u64,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "TALLY_LOG_FORMAT", default_value = "pretty", value_parser = parse_log_format)]
    pub log_format: LogFormat,
}

/// Arguments for the `authority` subcommand.
#[derive(Parser, Debug)]
pub struct AuthorityArgs {
    /// Directory holding the canonical ledger.
    #[arg(long, short = 'd', env = "TALLY_DATA_DIR", default_value = "./tally-authority")]
    pub data_dir: PathBuf,

    /// Port for the authority HTTP API.
    #[arg(long, env = "TALLY_HTTP_PORT", default_value_t = DEFAULT_AUTHORITY_PORT)]
    pub port: u16,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "TALLY_LOG_FORMAT", default_value = "pretty", value_parser = parse_log_format)]
    pub log_format: LogFormat,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Path to the data directory to initialize.
    #[arg(long, short = 'd', env = "TALLY_DATA_DIR", default_value = "./tally-data")]
    pub data_dir: PathBuf,

    /// Overwrite an existing device id.
    #[arg(long)]
    pub force: bool,
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        TallyNodeCli::command().debug_assert();
    }

    #[test]
    fn device_defaults() {
        let cli = TallyNodeCli::try_parse_from(["tally-node", "device"]).unwrap();
        let Commands::Device(args) = cli.command else {
            panic!("expected device subcommand");
        };
        assert_eq!(args.http_port, DEFAULT_DEVICE_PORT);
        assert_eq!(args.peer_port, DEFAULT_PEER_PORT);
        assert_eq!(args.sync_interval_secs, 300);
        assert_eq!(args.log_format, LogFormat::Pretty);
    }

    #[test]
    fn authority_json_logs() {
        let cli =
            TallyNodeCli::try_parse_from(["tally-node", "authority", "--log-format", "JSON"]).unwrap();
        let Commands::Authority(args) = cli.command else {
            panic!("expected authority subcommand");
        };
        assert_eq!(args.port, DEFAULT_AUTHORITY_PORT);
        assert_eq!(args.log_format, LogFormat::Json);
    }
}
