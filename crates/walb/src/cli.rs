//! Command line interface definition.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// WalB storage host: continuous block-level data protection.
#[derive(Parser)]
#[command(name = "walb")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Storage daemon address for client commands.
    #[arg(short, long, default_value = "127.0.0.1:10000")]
    pub addr: SocketAddr,

    /// Node id sent in protocol negotiations.
    #[arg(long, default_value = "walb-ctl")]
    pub id: String,

    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the storage daemon.
    Serve(ServeArgs),
    /// Show global or per-volume status.
    Status {
        /// Volume to inspect; omit for global status.
        vol_id: Option<String>,
    },
    /// Register a walb device as a volume.
    InitVol {
        /// Volume id.
        vol_id: String,
        /// Path of the walb device.
        wdev_path: String,
    },
    /// Remove a volume's persistent state.
    ClearVol {
        /// Volume id.
        vol_id: String,
    },
    /// Start log shipping (target) or log discarding (standby).
    Start {
        /// Volume id.
        vol_id: String,
        /// Role: `target` or `standby`.
        role: String,
    },
    /// Stop log shipping.
    Stop {
        /// Volume id.
        vol_id: String,
        /// Abort in-flight work instead of draining.
        #[arg(long)]
        force: bool,
    },
    /// Run a dirty full backup to the archive.
    FullBkp {
        /// Volume id.
        vol_id: String,
        /// Bulk size [lb].
        bulk_lb: Option<u16>,
    },
    /// Run a dirty hash backup to the archive.
    HashBkp {
        /// Volume id.
        vol_id: String,
        /// Bulk size [lb].
        bulk_lb: Option<u16>,
    },
    /// Take a snapshot and return its gid.
    Snapshot {
        /// Volume id.
        vol_id: String,
    },
    /// Reset a volume's log after overflow or re-base.
    ResetVol {
        /// Volume id.
        vol_id: String,
        /// Base gid of the reset volume.
        gid: Option<u64>,
    },
    /// Grow the exported device.
    Resize {
        /// Volume id.
        vol_id: String,
        /// New size [lb].
        new_size_lb: u64,
    },
    /// Re-check proxies and re-queue delayed tasks.
    Kick,
    /// Query a single fact.
    Get {
        /// One of state, host-type, vol, pid, is-overflow, uuid.
        target: String,
        /// Volume id, where applicable.
        vol_id: Option<String>,
    },
    /// Dump a logpack header block for analysis.
    DbgDumpLogpackHeader {
        /// Volume id.
        vol_id: String,
        /// Header lsid.
        lsid: u64,
    },
    /// Run a command on the server host.
    Exec {
        /// Command and arguments.
        #[arg(trailing_var_arg = true, required = true)]
        argv: Vec<String>,
    },
}

/// Arguments for the serve command.
#[derive(Args)]
pub struct ServeArgs {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Base directory for volume state (overrides config).
    #[arg(short, long)]
    pub base_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["walb", "status"]);
        assert!(matches!(cli.command, Commands::Status { vol_id: None }));

        let cli = Cli::parse_from(["walb", "init-vol", "vol0", "/dev/walb/0"]);
        match cli.command {
            Commands::InitVol { vol_id, wdev_path } => {
                assert_eq!(vol_id, "vol0");
                assert_eq!(wdev_path, "/dev/walb/0");
            }
            _ => panic!("expected init-vol"),
        }

        let cli = Cli::parse_from(["walb", "stop", "vol0", "--force"]);
        assert!(matches!(cli.command, Commands::Stop { force: true, .. }));

        let cli = Cli::parse_from(["walb", "serve", "--config", "/etc/walb/storage.toml"]);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.config, Some(PathBuf::from("/etc/walb/storage.toml")));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_exec_trailing_args() {
        let cli = Cli::parse_from(["walb", "exec", "ls", "-l", "/tmp"]);
        match cli.command {
            Commands::Exec { argv } => assert_eq!(argv, vec!["ls", "-l", "/tmp"]),
            _ => panic!("expected exec"),
        }
    }
}
