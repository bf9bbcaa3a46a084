//! Typed configuration records for the server and the client.
//!
//! Both load from TOML with every key declared up front; an unknown key is a
//! load error rather than something silently ignored.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::{timeouts, DEFAULT_MAX_ATTEMPTS, DEFAULT_TRANSFER_BUFFER};

/// What the file route does when the transfer ceiling is reached
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Queue until a slot frees up
    #[default]
    Wait,
    /// Answer 503 immediately
    Reject,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub root: PathBuf,
    pub cache_path: PathBuf,
    pub rebuild_interval_secs: u64,       // 0 = build at startup only
    pub max_concurrent_transfers: usize,  // 0 = unlimited
    pub admission: AdmissionPolicy,
    pub max_file_size: u64,               // 0 = unlimited
    pub path_traversal_protection: bool,
    pub compression: bool,
    pub transfer_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9040".to_string(),
            root: PathBuf::from("."),
            cache_path: PathBuf::from(".hashsync-manifest.json"),
            rebuild_interval_secs: 300,
            max_concurrent_transfers: 32,
            admission: AdmissionPolicy::Wait,
            max_file_size: 0,
            path_traversal_protection: true,
            compression: true,
            transfer_buffer_size: DEFAULT_TRANSFER_BUFFER,
        }
    }
}

impl ServerConfig {
    /// Parse without validating, for callers that merge CLI overrides first
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg = Self::from_file(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("bind must not be empty".into()));
        }
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("root must not be empty".into()));
        }
        if self.cache_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache_path must not be empty".into()));
        }
        if self.transfer_buffer_size == 0 {
            return Err(ConfigError::Invalid("transfer_buffer_size must be > 0".into()));
        }
        Ok(())
    }

    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_secs(self.rebuild_interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub manifest_url: String,
    pub local_root: PathBuf,
    pub diff_workers: usize,
    pub download_workers: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub connect_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    pub manifest_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub transfer_buffer_size: usize,
    pub report_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            manifest_url: String::new(),
            local_root: PathBuf::from("."),
            diff_workers: num_cpus::get().max(1),
            download_workers: 4,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: timeouts::RETRY_BACKOFF_MS,
            connect_timeout_secs: timeouts::CONNECT_SECS,
            transfer_timeout_secs: timeouts::TRANSFER_SECS,
            manifest_timeout_secs: timeouts::MANIFEST_SECS,
            progress_interval_ms: timeouts::PROGRESS_TICK_MS,
            transfer_buffer_size: DEFAULT_TRANSFER_BUFFER,
            report_file: None,
        }
    }
}

impl ClientConfig {
    /// Parse without validating, for callers that merge CLI overrides first
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg = Self::from_file(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manifest_url.trim().is_empty() {
            return Err(ConfigError::Invalid("manifest_url is required".into()));
        }
        if self.diff_workers == 0 || self.download_workers == 0 {
            return Err(ConfigError::Invalid("worker counts must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be >= 1".into()));
        }
        if self.transfer_buffer_size == 0 {
            return Err(ConfigError::Invalid("transfer_buffer_size must be > 0".into()));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_secs(self.manifest_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
