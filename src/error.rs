//! Error taxonomy for the server, the builder and the sync client.
//!
//! Only [`SyncError`] aborts a client run. Everything per-file is a
//! [`FileError`] and gets reported next to its file name.

use hyper::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a whole sync run
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to fetch manifest from {url}: {reason}")]
    ManifestFetch { url: String, reason: String },

    #[error("invalid manifest url {0}")]
    InvalidUrl(String),

    #[error("local storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("http client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

/// Errors isolated to a single manifest entry
#[derive(Debug, Error)]
pub enum FileError {
    #[error("cannot hash {path}: {source}")]
    LocalHash {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transient download error: {0}")]
    Transient(String),

    #[error("gave up after {attempts} attempts: {last}")]
    PermanentDownload { attempts: u32, last: String },

    #[error("unsafe entry name {0:?}")]
    InvalidName(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for FileError {
    fn from(e: std::io::Error) -> Self {
        FileError::Transient(e.to_string())
    }
}

impl From<reqwest::Error> for FileError {
    fn from(e: reqwest::Error) -> Self {
        FileError::Transient(e.to_string())
    }
}

/// Per-request failures on the file route. Each maps to a status code.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{path} is {size} bytes, limit is {limit}")]
    SizeLimitExceeded { path: String, size: u64, limit: u64 },

    #[error("transfer ceiling reached")]
    Overloaded,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServeError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::PathTraversal(_) | ServeError::NotFound(_) => StatusCode::NOT_FOUND,
            ServeError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServeError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ServeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Builder-side failures. The previously published cache stays in place.
#[derive(Debug, Error)]
pub enum CacheRebuildError {
    #[error("served root {path} unavailable: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("cannot publish cache {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("rebuild task panicked")]
    Join,

    #[error("rebuild cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
