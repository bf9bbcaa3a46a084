//! Hashsync Library
//!
//! Content-hash manifest publishing and incremental download: the server
//! side builds and serves a manifest of its file tree, the client side
//! fetches only the files whose content differs.

pub mod builder;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod diff;
pub mod error;
pub mod fetch;
pub mod fs_enum;
pub mod manifest;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod report;
pub mod server;
pub mod sync;
pub mod url;
pub mod work;

pub use builder::ManifestBuilder;
pub use config::{AdmissionPolicy, ClientConfig, ServerConfig};
pub use error::{CacheRebuildError, ConfigError, FileError, ServeError, SyncError};
pub use manifest::{Manifest, ManifestEntry};
pub use sync::{SyncReport, Syncer};
pub use work::{FileFailure, ProgressSnapshot, WorkItem};
