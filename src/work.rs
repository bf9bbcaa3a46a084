//! Work records shared by the diff engine, the fetch pool and reporting

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::manifest::ManifestEntry;

/// One file that must be (re)downloaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub entry: ManifestEntry,
    pub local_path: PathBuf,
    pub attempts: u32,
}

impl WorkItem {
    pub fn new(entry: ManifestEntry, local_path: PathBuf) -> Self {
        Self {
            entry,
            local_path,
            attempts: 0,
        }
    }
}

/// Pending -> InProgress -> {Success | Pending (retry) | PermanentlyFailed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ItemState {
    Pending,
    InProgress,
    Success,
    PermanentlyFailed,
}

/// A file the run could not materialize, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub name: String,
    pub attempts: u32,
    pub reason: String,
}

/// Terminal outcome of one WorkItem, as delivered to progress sinks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutcome {
    pub name: String,
    pub state: ItemState,
    pub attempts: u32,
    pub bytes: u64,
    pub error: Option<String>,
}

/// Point-in-time view of the fetch pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Bytes per second over the whole run so far
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }
}
