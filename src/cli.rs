//! Shared CLI helpers and small reusable Clap fragments

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::{AdmissionPolicy, ClientConfig, ServerConfig};
use crate::error::ConfigError;

/// Options for hashsyncd
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Hashsync manifest server")]
pub struct DaemonOpts {
    /// TOML config file; flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Root directory to serve
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Where the manifest cache is published
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Seconds between manifest rebuilds (0 = startup only)
    #[arg(long)]
    pub rebuild_interval: Option<u64>,

    /// Concurrent file transfers (0 = unlimited)
    #[arg(long)]
    pub max_transfers: Option<usize>,

    /// Largest servable file in bytes (0 = unlimited)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Answer 503 instead of queueing when the transfer ceiling is reached
    #[arg(long)]
    pub reject_when_busy: bool,

    /// Never gzip the manifest response
    #[arg(long)]
    pub no_compression: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl DaemonOpts {
    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        let mut cfg = match &self.config {
            Some(p) => ServerConfig::from_file(p)?,
            None => ServerConfig::default(),
        };
        if let Some(v) = &self.bind {
            cfg.bind = v.clone();
        }
        if let Some(v) = &self.root {
            cfg.root = v.clone();
        }
        if let Some(v) = &self.cache {
            cfg.cache_path = v.clone();
        }
        if let Some(v) = self.rebuild_interval {
            cfg.rebuild_interval_secs = v;
        }
        if let Some(v) = self.max_transfers {
            cfg.max_concurrent_transfers = v;
        }
        if let Some(v) = self.max_file_size {
            cfg.max_file_size = v;
        }
        if self.reject_when_busy {
            cfg.admission = AdmissionPolicy::Reject;
        }
        if self.no_compression {
            cfg.compression = false;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Options for the hashsync client
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Hashsync - fetch only what changed")]
pub struct SyncOpts {
    /// Manifest URL, e.g. http://host:9040/
    #[arg(required_unless_present = "config")]
    pub url: Option<String>,

    /// Local directory to bring in line with the manifest
    pub destination: Option<PathBuf>,

    /// TOML config file; flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Hashing workers (0 = config/default)
    #[arg(long, default_value_t = 0)]
    pub diff_workers: usize,

    /// Download workers (0 = config/default)
    #[arg(short = 'j', long, default_value_t = 0)]
    pub workers: usize,

    /// Attempts per file before giving up (0 = config/default)
    #[arg(long, default_value_t = 0)]
    pub attempts: u32,

    /// Write JSONL transfer records to file
    #[arg(long = "report")]
    pub report_file: Option<PathBuf>,

    /// List what would be downloaded, fetch nothing
    #[arg(short = 'l', long, alias = "list-only")]
    pub dry_run: bool,

    /// Show individual file operations as they happen
    #[arg(short, long)]
    pub progress: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl SyncOpts {
    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        let mut cfg = match &self.config {
            Some(p) => ClientConfig::from_file(p)?,
            None => ClientConfig::default(),
        };
        if let Some(v) = &self.url {
            cfg.manifest_url = v.clone();
        }
        if let Some(v) = &self.destination {
            cfg.local_root = v.clone();
        }
        if self.diff_workers > 0 {
            cfg.diff_workers = self.diff_workers;
        }
        if self.workers > 0 {
            cfg.download_workers = self.workers;
        }
        if self.attempts > 0 {
            cfg.max_attempts = self.attempts;
        }
        if self.report_file.is_some() {
            cfg.report_file = self.report_file.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Install the fmt subscriber. `RUST_LOG` wins over the verbosity flag.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_flags_override_defaults() {
        let opts = DaemonOpts::parse_from([
            "hashsyncd",
            "--root",
            "/srv/dist",
            "--max-transfers",
            "0",
            "--reject-when-busy",
            "--no-compression",
        ]);
        let cfg = opts.server_config().unwrap();
        assert_eq!(cfg.root, PathBuf::from("/srv/dist"));
        assert_eq!(cfg.max_concurrent_transfers, 0);
        assert_eq!(cfg.admission, AdmissionPolicy::Reject);
        assert!(!cfg.compression);
    }

    #[test]
    fn sync_flags_build_client_config() {
        let opts = SyncOpts::parse_from(["hashsync", "http://h:9040/", "/data", "-j", "8", "--attempts", "5"]);
        let cfg = opts.client_config().unwrap();
        assert_eq!(cfg.manifest_url, "http://h:9040/");
        assert_eq!(cfg.local_root, PathBuf::from("/data"));
        assert_eq!(cfg.download_workers, 8);
        assert_eq!(cfg.max_attempts, 5);
    }

    #[test]
    fn url_may_come_from_flag_when_config_lacks_it() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("c.toml");
        std::fs::write(&p, "download_workers = 3\n").unwrap();
        let opts = SyncOpts::parse_from([
            "hashsync",
            "--config",
            p.to_str().unwrap(),
            "http://h/",
        ]);
        let cfg = opts.client_config().unwrap();
        assert_eq!(cfg.download_workers, 3);
        assert_eq!(cfg.manifest_url, "http://h/");
    }
}
