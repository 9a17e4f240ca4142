//! Daemon configuration: TOML file, then command-line overrides.

use crate::cli::DaemonOpts;
use crate::protocol::DEFAULT_PORT;
use crate::snapshot::{ScanMode, ScanOptions, DEFAULT_SCAN_INTERVAL};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (host:port)
    pub bind: String,
    /// Directory whose files are served
    pub root: PathBuf,
    pub recursive: bool,
    /// Skip content hashing; diff falls back to size + mtime
    pub fast_scan: bool,
    pub scan_interval_secs: u64,
    /// Hashing threads per scan
    pub scan_parallelism: usize,
    /// Admission gate size
    pub max_connections: usize,
    /// How long a new connection may wait for a free slot before BUSY
    pub admission_grace_ms: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    pub idle_timeout_secs: u64,
    /// Largest request the server will decode, after decompression
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{}", DEFAULT_PORT),
            root: PathBuf::from("."),
            recursive: true,
            fast_scan: false,
            scan_interval_secs: DEFAULT_SCAN_INTERVAL.as_secs(),
            scan_parallelism: num_cpus::get(),
            max_connections: 64,
            admission_grace_ms: 250,
            workers: (num_cpus::get() / 2).max(1),
            queue_capacity: 128,
            idle_timeout_secs: 300,
            max_request_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(s).context("Failed to parse config")?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&data)
    }

    /// Start from the config file named in `opts` (or defaults) and apply flags.
    pub fn from_opts(opts: &DaemonOpts) -> Result<Self> {
        let mut config = match opts.config {
            Some(ref path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(opts);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, opts: &DaemonOpts) {
        if let Some(ref bind) = opts.bind {
            self.bind = bind.clone();
        }
        if let Some(ref root) = opts.root {
            self.root = root.clone();
        }
        if opts.no_recursive {
            self.recursive = false;
        }
        if opts.fast_scan {
            self.fast_scan = true;
        }
        if let Some(n) = opts.max_connections {
            self.max_connections = n;
        }
        if let Some(n) = opts.workers {
            self.workers = n;
        }
        if let Some(n) = opts.scan_interval {
            self.scan_interval_secs = n;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.max_request_bytes == 0 {
            bail!("max_request_bytes must be at least 1");
        }
        if self.scan_interval_secs == 0 {
            bail!("scan_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            recursive: self.recursive,
            mode: if self.fast_scan {
                ScanMode::Fast
            } else {
                ScanMode::Full
            },
            parallelism: self.scan_parallelism,
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn admission_grace(&self) -> Duration {
        Duration::from_millis(self.admission_grace_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let c = ServerConfig::default();
        assert_eq!(c.bind, "0.0.0.0:5001");
        assert_eq!(c.scan_interval(), Duration::from_secs(30));
        assert!(c.workers >= 1);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = ServerConfig::from_toml_str("root = \"/srv/files\"\nfast_scan = true\nworkers = 3\n").unwrap();
        assert_eq!(c.root, PathBuf::from("/srv/files"));
        assert!(c.fast_scan);
        assert_eq!(c.workers, 3);
        assert_eq!(c.max_connections, 64);
        assert_eq!(c.scan_options().mode, ScanMode::Fast);
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syncwired.toml");
        std::fs::write(&path, "bind = \"127.0.0.1:6000\"\nmax_connections = 8\n").unwrap();

        let opts = DaemonOpts::parse_from([
            "syncwired",
            "--config",
            path.to_str().unwrap(),
            "--max-connections",
            "2",
            "--no-recursive",
        ]);
        let c = ServerConfig::from_opts(&opts).unwrap();
        assert_eq!(c.bind, "127.0.0.1:6000");
        assert_eq!(c.max_connections, 2);
        assert!(!c.recursive);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut c = ServerConfig::default();
        c.workers = 0;
        assert!(c.validate().is_err());
        let mut c = ServerConfig::default();
        c.queue_capacity = 0;
        assert!(c.validate().is_err());
        let mut c = ServerConfig::default();
        c.max_request_bytes = 0;
        assert!(c.validate().is_err());
        assert!(ServerConfig::from_toml_str("workers = \"many\"").is_err());
    }
}
