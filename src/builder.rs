//! Manifest builder: walks the served root, hashes every file and publishes
//! the result as one atomic cache swap.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checksum;
use crate::error::CacheRebuildError;
use crate::fs_enum::{enumerate_served, sweep_stale_temps};
use crate::manifest::{write_cache_atomic, Manifest, ManifestEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildStats {
    pub files: usize,
    pub skipped: usize,
    pub elapsed: Duration,
}

pub struct ManifestBuilder {
    root: PathBuf,
    cache_path: PathBuf,
    buffer_size: usize,
    /// Held for the duration of a rebuild; a second trigger that cannot take
    /// it returns immediately.
    running: Mutex<()>,
}

impl ManifestBuilder {
    pub fn new(root: impl Into<PathBuf>, cache_path: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            root: root.into(),
            cache_path: cache_path.into(),
            buffer_size: buffer_size.max(1),
            running: Mutex::new(()),
        }
    }

    /// Rebuild and publish the manifest (blocking).
    ///
    /// Returns `Ok(None)` when a rebuild is already running; that rebuild
    /// satisfies this trigger. `cancel` is checked between files; a cancelled
    /// rebuild publishes nothing.
    pub fn rebuild(&self, cancel: &CancellationToken) -> Result<Option<RebuildStats>, CacheRebuildError> {
        let Some(_guard) = self.running.try_lock() else {
            debug!("rebuild already in progress; trigger coalesced");
            return Ok(None);
        };

        let started = Instant::now();
        let exclude = std::fs::canonicalize(&self.cache_path).ok();
        let walk_root = std::fs::canonicalize(&self.root).map_err(|source| {
            CacheRebuildError::Root {
                path: self.root.clone(),
                source,
            }
        })?;
        let listing = enumerate_served(&walk_root, exclude.as_deref());

        let mut entries = Vec::with_capacity(listing.files.len());
        let mut skipped = listing.skipped;
        for file in listing.files {
            if cancel.is_cancelled() {
                return Err(CacheRebuildError::Cancelled);
            }
            match checksum::hash_file(&file.path, self.buffer_size) {
                Ok(hash) => entries.push(ManifestEntry::new(file.name, hash)),
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "cannot hash file; left out of manifest");
                    skipped += 1;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(CacheRebuildError::Cancelled);
        }
        let manifest = Manifest::new(entries);
        write_cache_atomic(&self.cache_path, &manifest)?;

        Ok(Some(RebuildStats {
            files: manifest.len(),
            skipped,
            elapsed: started.elapsed(),
        }))
    }

    /// Rebuild on the blocking pool and log the outcome. Never fails: a
    /// failed rebuild keeps the previous cache authoritative.
    pub async fn rebuild_logged(self: &Arc<Self>, cancel: &CancellationToken) {
        let this = Arc::clone(self);
        let token = cancel.clone();
        let result = tokio::task::spawn_blocking(move || this.rebuild(&token))
            .await
            .unwrap_or(Err(CacheRebuildError::Join));
        match result {
            Ok(Some(stats)) => info!(
                files = stats.files,
                skipped = stats.skipped,
                ms = stats.elapsed.as_millis() as u64,
                cache = %self.cache_path.display(),
                "manifest published"
            ),
            Ok(None) => {}
            Err(CacheRebuildError::Cancelled) => debug!("manifest rebuild abandoned"),
            Err(e) => error!(error = %e, "manifest rebuild failed; serving previous cache"),
        }
    }

    /// Build once now, then every `interval` until `cancel` fires.
    /// A zero interval disables the periodic part.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        if let Some(dir) = self.cache_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let removed = sweep_stale_temps(dir, 1);
            if removed > 0 {
                info!(removed, dir = %dir.display(), "removed stale cache temp files");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = self.rebuild_logged(&cancel) => {}
        }
        if interval.is_zero() {
            debug!("periodic manifest rebuild disabled");
            return;
        }

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.rebuild_logged(&cancel).await,
            }
        }
        debug!("rebuild loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{read_cache, Manifest};

    fn tree() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("served/nested")).unwrap();
        std::fs::write(tmp.path().join("served/a.txt"), b"").unwrap();
        std::fs::write(tmp.path().join("served/nested/b.txt"), b"hello world").unwrap();
        tmp
    }

    #[test]
    fn rebuild_publishes_every_file() {
        let tmp = tree();
        let cache = tmp.path().join("cache/manifest.json");
        let builder = ManifestBuilder::new(tmp.path().join("served"), &cache, 8);
        let stats = builder.rebuild(&CancellationToken::new()).unwrap().unwrap();
        assert_eq!(stats.files, 2);

        let m = Manifest::from_slice(&read_cache(&cache).unwrap()).unwrap();
        assert_eq!(m.get("a.txt").unwrap().hash, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            m.get("nested/b.txt").unwrap().hash,
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn cache_inside_root_is_not_listed() {
        let tmp = tree();
        let cache = tmp.path().join("served/.manifest.json");
        let builder = ManifestBuilder::new(tmp.path().join("served"), &cache, 1024);
        builder.rebuild(&CancellationToken::new()).unwrap();
        builder.rebuild(&CancellationToken::new()).unwrap();
        let m = Manifest::from_slice(&read_cache(&cache).unwrap()).unwrap();
        assert_eq!(m.len(), 2);
        assert!(m.get(".manifest.json").is_none());
    }

    #[test]
    fn concurrent_trigger_is_a_no_op() {
        let tmp = tree();
        let builder = ManifestBuilder::new(tmp.path().join("served"), tmp.path().join("m.json"), 64);
        let _held = builder.running.lock();
        assert_eq!(builder.rebuild(&CancellationToken::new()).unwrap(), None);
        assert!(!tmp.path().join("m.json").exists());
    }

    #[test]
    fn failed_rebuild_keeps_previous_cache() {
        let tmp = tree();
        let cache = tmp.path().join("m.json");
        let builder = ManifestBuilder::new(tmp.path().join("served"), &cache, 64);
        builder.rebuild(&CancellationToken::new()).unwrap();
        let before = std::fs::read(&cache).unwrap();

        std::fs::remove_dir_all(tmp.path().join("served")).unwrap();
        assert!(builder.rebuild(&CancellationToken::new()).is_err());
        assert_eq!(std::fs::read(&cache).unwrap(), before);
    }

    #[tokio::test]
    async fn periodic_loop_stops_on_cancel() {
        let tmp = tree();
        let cache = tmp.path().join("m.json");
        let builder = Arc::new(ManifestBuilder::new(tmp.path().join("served"), &cache, 64));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(builder.run_periodic(Duration::from_millis(20), cancel.clone()));

        for _ in 0..100 {
            if cache.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.exists());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[test]
    fn cancelled_rebuild_publishes_nothing() {
        let tmp = tree();
        let cache = tmp.path().join("m.json");
        let builder = ManifestBuilder::new(tmp.path().join("served"), &cache, 64);
        builder.rebuild(&CancellationToken::new()).unwrap();
        let before = std::fs::read(&cache).unwrap();

        std::fs::write(tmp.path().join("served/c.txt"), b"new").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(builder.rebuild(&cancel), Err(CacheRebuildError::Cancelled)));
        assert_eq!(std::fs::read(&cache).unwrap(), before);
        // the guard is released, so the next trigger runs
        assert!(builder.rebuild(&CancellationToken::new()).unwrap().is_some());
    }

    #[test]
    fn cancel_between_files_stops_the_walk() {
        let tmp = tempfile::tempdir().unwrap();
        let served = tmp.path().join("served");
        std::fs::create_dir_all(&served).unwrap();
        for i in 0..400 {
            std::fs::write(served.join(format!("f{i:03}")), vec![i as u8; 16 * 1024]).unwrap();
        }
        let cache = tmp.path().join("m.json");
        std::fs::write(&cache, b"[]").unwrap();
        let builder = Arc::new(ManifestBuilder::new(&served, &cache, 512));

        let cancel = CancellationToken::new();
        let worker = {
            let builder = Arc::clone(&builder);
            let cancel = cancel.clone();
            std::thread::spawn(move || builder.rebuild(&cancel))
        };
        cancel.cancel();
        match worker.join().unwrap() {
            // cancelled before or during the walk: nothing published
            Err(CacheRebuildError::Cancelled) => assert_eq!(std::fs::read(&cache).unwrap(), b"[]"),
            // finished before the token was seen: a complete manifest
            Ok(Some(stats)) => assert_eq!(stats.files, 400),
            other => panic!("unexpected rebuild result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn periodic_tick_picks_up_new_files() {
        let tmp = tree();
        let cache = tmp.path().join("m.json");
        let builder = Arc::new(ManifestBuilder::new(tmp.path().join("served"), &cache, 64));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(builder.run_periodic(Duration::from_millis(100), cancel.clone()));

        for _ in 0..100 {
            if cache.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let eager = Manifest::from_slice(&read_cache(&cache).unwrap()).unwrap();
        assert_eq!(eager.len(), 2);

        std::fs::write(tmp.path().join("served/late.txt"), b"late").unwrap();
        let mut seen = false;
        for _ in 0..100 {
            let m = Manifest::from_slice(&read_cache(&cache).unwrap()).unwrap();
            if m.get("late.txt").is_some() {
                assert_eq!(m.len(), 3);
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen, "periodic rebuild never listed the new file");
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stale_cache_temps_are_swept_and_never_listed() {
        let tmp = tree();
        let served = tmp.path().join("served");
        let cache = served.join(".manifest.json");
        let stale = served.join(".hashsync-abc123.tmp");
        std::fs::write(&stale, b"[{\"name\":").unwrap();

        let builder = ManifestBuilder::new(&served, &cache, 64);
        builder.rebuild(&CancellationToken::new()).unwrap();
        let m = Manifest::from_slice(&read_cache(&cache).unwrap()).unwrap();
        assert!(m.get(".hashsync-abc123.tmp").is_none());
        assert_eq!(m.len(), 2);

        Arc::new(builder)
            .run_periodic(Duration::ZERO, CancellationToken::new())
            .await;
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn zero_interval_builds_once_and_returns() {
        let tmp = tree();
        let cache = tmp.path().join("m.json");
        let builder = Arc::new(ManifestBuilder::new(tmp.path().join("served"), &cache, 64));
        tokio::time::timeout(
            Duration::from_secs(5),
            builder.run_periodic(Duration::ZERO, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(cache.exists());
    }
}
