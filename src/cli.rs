//! Shared CLI helpers and small reusable Clap fragments

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Options for the syncwired daemon. Unset flags fall back to the config file,
/// then to built-in defaults.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Syncwire daemon - serve a folder for snapshot-diff sync")]
pub struct DaemonOpts {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port) [default: 0.0.0.0:5001]
    #[arg(long)]
    pub bind: Option<String>,

    /// Root directory to serve [default: .]
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Only serve files directly under the root
    #[arg(long)]
    pub no_recursive: bool,

    /// Skip content hashing during scans
    #[arg(long)]
    pub fast_scan: bool,

    /// Maximum simultaneous connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Worker tasks processing requests
    #[arg(long)]
    pub workers: Option<usize>,

    /// Seconds between background rescans
    #[arg(long)]
    pub scan_interval: Option<u64>,

    /// Append server events to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

/// Options for the syncwire client
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Syncwire client - fetch changed files from a syncwired server")]
pub struct ClientOpts {
    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// Fetch one file (syncwire://host:port/path) unless the local copy is current
    Get {
        remote: String,
        dest: PathBuf,
    },
    /// Show how a local folder differs from the server
    Diff {
        remote: String,
        folder: PathBuf,
    },
    /// Download everything that differs into a local folder
    Pull {
        remote: String,
        folder: PathBuf,
        /// Delete local files the server no longer has
        #[arg(long, alias = "mirror")]
        delete: bool,
        /// Show individual file operations as they happen
        #[arg(short, long)]
        verbose: bool,
    },
}
