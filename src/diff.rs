//! Diff engine: decides which manifest entries the local tree lacks or holds
//! with different content.
//!
//! A fixed pool of workers drains a shared FIFO of entries. Missing files
//! are queued without hashing; present files are stream-hashed on the
//! blocking pool. Local files the manifest does not mention are never
//! touched.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checksum::{hash_file, hashes_match};
use crate::error::FileError;
use crate::fs_enum::local_path_for;
use crate::manifest::{Manifest, ManifestEntry};
use crate::work::{FileFailure, WorkItem};

#[derive(Debug, Default)]
pub struct DiffOutcome {
    /// Entries that need a download, in completion order
    pub items: Vec<WorkItem>,
    /// Entries whose names are unsafe to materialize locally
    pub rejected: Vec<FileFailure>,
    pub examined: usize,
    pub cancelled: bool,
}

enum LocalState {
    Missing,
    Present(String),
}

pub struct DiffEngine {
    local_root: PathBuf,
    workers: usize,
    buffer_size: usize,
}

impl DiffEngine {
    pub fn new(local_root: impl Into<PathBuf>, workers: usize, buffer_size: usize) -> Self {
        Self {
            local_root: local_root.into(),
            workers: workers.max(1),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Compare every entry against the local tree. Returns once the entry
    /// source is exhausted and every worker has finished.
    pub async fn run(&self, manifest: Manifest, cancel: &CancellationToken) -> DiffOutcome {
        let total = manifest.len();
        let source = Arc::new(Mutex::new(VecDeque::from(manifest.entries)));
        let outcome = Arc::new(Mutex::new(DiffOutcome::default()));

        let mut workers = JoinSet::new();
        for _ in 0..self.workers.min(total.max(1)) {
            let source = Arc::clone(&source);
            let outcome = Arc::clone(&outcome);
            let cancel = cancel.clone();
            let root = self.local_root.clone();
            let buffer_size = self.buffer_size;
            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        outcome.lock().cancelled = true;
                        break;
                    }
                    let Some(entry) = source.lock().pop_front() else { break };
                    let verdict = examine(&root, entry, buffer_size).await;
                    let mut out = outcome.lock();
                    out.examined += 1;
                    match verdict {
                        Ok(Some(item)) => out.items.push(item),
                        Ok(None) => {}
                        Err(failure) => out.rejected.push(failure),
                    }
                }
            });
        }
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "diff worker panicked");
            }
        }

        let mut outcome = std::mem::take(&mut *outcome.lock());
        if !source.lock().is_empty() {
            outcome.cancelled = true;
        }
        debug!(
            examined = outcome.examined,
            queued = outcome.items.len(),
            rejected = outcome.rejected.len(),
            "diff complete"
        );
        outcome
    }
}

/// Ok(Some) if the entry must be downloaded, Ok(None) if the local copy
/// already matches.
async fn examine(
    root: &Path,
    entry: ManifestEntry,
    buffer_size: usize,
) -> Result<Option<WorkItem>, FileFailure> {
    let local_path = match local_path_for(root, &entry.name) {
        Ok(p) => p,
        Err(why) => {
            warn!(name = %entry.name, reason = why, "manifest entry rejected");
            return Err(FileFailure {
                reason: FileError::InvalidName(entry.name.clone()).to_string(),
                name: entry.name,
                attempts: 0,
            });
        }
    };

    let path = local_path.clone();
    let state = tokio::task::spawn_blocking(move || local_state(&path, buffer_size))
        .await
        .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)));

    match state {
        Ok(LocalState::Missing) => Ok(Some(WorkItem::new(entry, local_path))),
        Ok(LocalState::Present(hash)) if hashes_match(&hash, &entry.hash) => Ok(None),
        Ok(LocalState::Present(_)) => Ok(Some(WorkItem::new(entry, local_path))),
        Err(source) => {
            // Unreadable counts as absent: fetch it again.
            let err = FileError::LocalHash {
                path: local_path.clone(),
                source,
            };
            warn!(error = %err, "local file unreadable; scheduling download");
            Ok(Some(WorkItem::new(entry, local_path)))
        }
    }
}

fn local_state(path: &Path, buffer_size: usize) -> io::Result<LocalState> {
    match std::fs::metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LocalState::Missing),
        Err(e) => Err(e),
        Ok(meta) if !meta.is_file() => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        )),
        Ok(_) => hash_file(path, buffer_size).map(LocalState::Present),
    }
}
