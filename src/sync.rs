//! Client orchestration: fetch the manifest, diff it against the local tree,
//! then download what is missing or stale.
//!
//! The two phases run strictly in sequence: the full mismatch set is known
//! before any download starts.

use reqwest::Client;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::diff::{DiffEngine, DiffOutcome};
use crate::error::SyncError;
use crate::fetch::{build_client, fetch_manifest};
use crate::fs_enum::sweep_stale_temps;
use crate::manifest::Manifest;
use crate::pool::{FetchPool, PoolSettings};
use crate::progress::{Phase, ProgressSink};
use crate::url::RemoteEndpoint;
use crate::work::FileFailure;

/// Final result of one sync run
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub manifest_entries: usize,
    /// WorkItems the diff produced
    pub queued: usize,
    pub downloaded: usize,
    pub bytes: u64,
    pub elapsed: Duration,
    /// Files that could not be materialized, each with its own reason
    pub failures: Vec<FileFailure>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

pub struct Syncer {
    config: ClientConfig,
    endpoint: RemoteEndpoint,
    client: Client,
}

impl Syncer {
    pub fn new(config: ClientConfig) -> Result<Self, SyncError> {
        let endpoint = RemoteEndpoint::parse(&config.manifest_url)?;
        let client = build_client(&config)?;
        Ok(Self {
            config,
            endpoint,
            client,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn fetch_manifest(&self) -> Result<Manifest, SyncError> {
        fetch_manifest(
            &self.client,
            self.endpoint.manifest_url(),
            self.config.manifest_timeout(),
        )
        .await
    }

    /// Fetch and diff without downloading anything
    pub async fn plan(&self, cancel: &CancellationToken) -> Result<DiffOutcome, SyncError> {
        let manifest = self.fetch_manifest().await?;
        self.prepare_root().await?;
        Ok(self.diff_engine().run(manifest, cancel).await)
    }

    pub async fn run(
        &self,
        sink: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();

        sink.phase(Phase::FetchingManifest);
        let manifest = self.fetch_manifest().await?;
        self.prepare_root().await?;
        self.sweep_stale_downloads().await;

        let mut report = SyncReport {
            manifest_entries: manifest.len(),
            ..Default::default()
        };
        sink.phase(Phase::Comparing {
            entries: manifest.len(),
        });
        let diff = self.diff_engine().run(manifest, cancel).await;
        report.queued = diff.items.len();
        report.failures = diff.rejected;
        info!(
            entries = report.manifest_entries,
            queued = report.queued,
            "local tree compared"
        );

        if diff.cancelled {
            report.cancelled = true;
        } else if !diff.items.is_empty() {
            sink.phase(Phase::Downloading {
                files: diff.items.len(),
            });
            let pool = FetchPool::new(self.client.clone(), self.endpoint.clone(), self.pool_settings());
            let outcome = pool.run(diff.items, sink, cancel).await;
            report.downloaded = outcome.downloaded;
            report.bytes = outcome.bytes;
            report.cancelled = outcome.cancelled;
            report.failures.extend(outcome.failures);
        }

        report.elapsed = started.elapsed();
        info!(
            downloaded = report.downloaded,
            failed = report.failures.len(),
            bytes = report.bytes,
            ms = report.elapsed.as_millis() as u64,
            cancelled = report.cancelled,
            "sync finished"
        );
        sink.done(&report);
        Ok(report)
    }

    fn diff_engine(&self) -> DiffEngine {
        DiffEngine::new(
            self.config.local_root.clone(),
            self.config.diff_workers,
            self.config.transfer_buffer_size,
        )
    }

    fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            workers: self.config.download_workers,
            max_attempts: self.config.max_attempts,
            retry_backoff: self.config.retry_backoff(),
            buffer_size: self.config.transfer_buffer_size,
            progress_interval: self.config.progress_interval(),
        }
    }

    /// Partial downloads from a run that was killed outright
    async fn sweep_stale_downloads(&self) {
        let root = self.config.local_root.clone();
        match tokio::task::spawn_blocking(move || sweep_stale_temps(&root, usize::MAX)).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "removed stale partial downloads"),
            Err(e) => warn!(error = %e, "stale download sweep failed"),
        }
    }

    async fn prepare_root(&self) -> Result<(), SyncError> {
        let root = &self.config.local_root;
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| SyncError::Storage {
                path: root.clone(),
                source,
            })
    }
}
