//! Fetch pool: downloads queued WorkItems with bounded concurrency and
//! bounded retries.
//!
//! Items live in an arena owned by [`WorkQueue`]; the FIFO carries only ids.
//! A worker that pops an id holds that item exclusively until it completes,
//! fails for good, or is pushed back for another attempt, so the attempt
//! counter is only ever touched under the queue lock by its current holder.

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checksum::{hashes_match, ContentHasher};
use crate::error::FileError;
use crate::fs_enum::{PART_SUFFIX, TEMP_PREFIX};
use crate::progress::ProgressSink;
use crate::url::RemoteEndpoint;
use crate::work::{FileFailure, FileOutcome, ItemState, ProgressSnapshot, WorkItem};

pub type ItemId = usize;

#[derive(Debug)]
struct Slot {
    item: WorkItem,
    state: ItemState,
    bytes: u64,
    last_error: Option<String>,
}

struct QueueState {
    slots: Vec<Slot>,
    pending: VecDeque<ItemId>,
    /// Workers currently holding an item
    active: usize,
}

/// What happens to an item after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Below the ceiling; the holder re-queues it
    Retry(u32),
    /// Ceiling reached; terminal
    GaveUp(u32),
}

pub struct WorkQueue {
    inner: Mutex<QueueState>,
    wake: Notify,
}

impl WorkQueue {
    pub fn new(items: Vec<WorkItem>) -> Self {
        let pending = (0..items.len()).collect();
        let slots = items
            .into_iter()
            .map(|item| Slot {
                item,
                state: ItemState::Pending,
                bytes: 0,
                last_error: None,
            })
            .collect();
        Self {
            inner: Mutex::new(QueueState {
                slots,
                pending,
                active: 0,
            }),
            wake: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next pending item, waiting while other workers still hold items that
    /// may come back. None once the queue is drained and every worker is
    /// idle, or on cancellation.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<(ItemId, WorkItem)> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let woken = self.wake.notified();
            {
                let mut q = self.inner.lock();
                if let Some(id) = q.pending.pop_front() {
                    q.active += 1;
                    let slot = &mut q.slots[id];
                    slot.state = ItemState::InProgress;
                    return Some((id, slot.item.clone()));
                }
                if q.active == 0 {
                    return None;
                }
            }
            tokio::select! {
                _ = woken => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn complete(&self, id: ItemId, bytes: u64) {
        {
            let mut q = self.inner.lock();
            let slot = &mut q.slots[id];
            slot.state = ItemState::Success;
            slot.bytes = bytes;
            slot.last_error = None;
            q.active -= 1;
        }
        self.wake.notify_waiters();
    }

    /// Count a failed attempt. On `GaveUp` the item is terminal and released;
    /// on `Retry` the caller still holds it and must call [`requeue`].
    ///
    /// [`requeue`]: WorkQueue::requeue
    pub fn fail(&self, id: ItemId, reason: String, max_attempts: u32) -> Attempt {
        let verdict = {
            let mut q = self.inner.lock();
            let slot = &mut q.slots[id];
            slot.item.attempts += 1;
            slot.last_error = Some(reason);
            let attempts = slot.item.attempts;
            if attempts < max_attempts.max(1) {
                Attempt::Retry(attempts)
            } else {
                slot.state = ItemState::PermanentlyFailed;
                q.active -= 1;
                Attempt::GaveUp(attempts)
            }
        };
        if matches!(verdict, Attempt::GaveUp(_)) {
            self.wake.notify_waiters();
        }
        verdict
    }

    pub fn requeue(&self, id: ItemId) {
        {
            let mut q = self.inner.lock();
            q.slots[id].state = ItemState::Pending;
            q.pending.push_back(id);
            q.active -= 1;
        }
        self.wake.notify_waiters();
    }

    /// Release an item without counting an attempt (cancellation)
    pub fn abandon(&self, id: ItemId) {
        self.requeue(id);
    }

    pub fn state(&self, id: ItemId) -> ItemState {
        self.inner.lock().slots[id].state
    }

    pub fn attempts(&self, id: ItemId) -> u32 {
        self.inner.lock().slots[id].item.attempts
    }

    fn outcomes(&self) -> Vec<FileOutcome> {
        self.inner
            .lock()
            .slots
            .iter()
            .map(|s| FileOutcome {
                name: s.item.entry.name.clone(),
                state: s.state,
                attempts: s.item.attempts,
                bytes: s.bytes,
                error: s.last_error.clone(),
            })
            .collect()
    }
}

/// Tuning for one pool run
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub buffer_size: usize,
    pub progress_interval: Duration,
}

#[derive(Debug, Default)]
pub struct PoolOutcome {
    pub downloaded: usize,
    pub bytes: u64,
    pub failures: Vec<FileFailure>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

struct Shared {
    queue: WorkQueue,
    client: Client,
    endpoint: RemoteEndpoint,
    settings: PoolSettings,
    bytes: AtomicU64,
    completed: AtomicUsize,
    failed: AtomicUsize,
    started: Instant,
}

impl Shared {
    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            total: self.queue.len(),
            bytes: self.bytes.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

pub struct FetchPool {
    client: Client,
    endpoint: RemoteEndpoint,
    settings: PoolSettings,
}

impl FetchPool {
    pub fn new(client: Client, endpoint: RemoteEndpoint, settings: PoolSettings) -> Self {
        Self {
            client,
            endpoint,
            settings,
        }
    }

    /// Download every item. Per-file failures are collected, never raised.
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        sink: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> PoolOutcome {
        let shared = Arc::new(Shared {
            queue: WorkQueue::new(items),
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            settings: self.settings.clone(),
            bytes: AtomicU64::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            started: Instant::now(),
        });
        let total = shared.queue.len();

        let (events, mut finished_rx) = mpsc::unbounded_channel::<FileOutcome>();
        let mut workers = JoinSet::new();
        for _ in 0..self.settings.workers.max(1).min(total.max(1)) {
            let shared = Arc::clone(&shared);
            let events = events.clone();
            let cancel = cancel.clone();
            workers.spawn(worker(shared, events, cancel));
        }
        drop(events);

        // Single reporting sink: per-file events as they land, snapshots on a
        // fixed tick, one final snapshot once every worker has hung up.
        let mut ticker = tokio::time::interval(self.settings.progress_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                ev = finished_rx.recv() => match ev {
                    Some(outcome) => sink.file_finished(&outcome),
                    None => break,
                },
                _ = ticker.tick() => sink.progress(&shared.snapshot()),
            }
        }
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "download worker panicked");
            }
        }
        sink.progress(&shared.snapshot());

        let mut outcome = PoolOutcome {
            bytes: shared.bytes.load(Ordering::Relaxed),
            elapsed: shared.started.elapsed(),
            ..Default::default()
        };
        for file in shared.queue.outcomes() {
            match file.state {
                ItemState::Success => outcome.downloaded += 1,
                ItemState::PermanentlyFailed => outcome.failures.push(FileFailure {
                    name: file.name,
                    attempts: file.attempts,
                    reason: file.error.unwrap_or_default(),
                }),
                ItemState::Pending | ItemState::InProgress => outcome.cancelled = true,
            }
        }
        outcome
    }
}

async fn worker(
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<FileOutcome>,
    cancel: CancellationToken,
) {
    let max_attempts = shared.settings.max_attempts;
    while let Some((id, item)) = shared.queue.next(&cancel).await {
        match download(&shared, &item, &cancel).await {
            Ok(bytes) => {
                shared.queue.complete(id, bytes);
                shared.completed.fetch_add(1, Ordering::Relaxed);
                debug!(name = %item.entry.name, bytes, "downloaded");
                let _ = events.send(FileOutcome {
                    name: item.entry.name,
                    state: ItemState::Success,
                    attempts: item.attempts + 1,
                    bytes,
                    error: None,
                });
            }
            Err(FileError::Cancelled) => {
                shared.queue.abandon(id);
                break;
            }
            Err(e) => {
                let reason = e.to_string();
                match shared.queue.fail(id, reason.clone(), max_attempts) {
                    Attempt::Retry(n) => {
                        debug!(name = %item.entry.name, attempt = n, error = %reason, "retrying");
                        let backoff = shared.settings.retry_backoff * n;
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => {}
                        }
                        shared.queue.requeue(id);
                    }
                    Attempt::GaveUp(n) => {
                        shared.failed.fetch_add(1, Ordering::Relaxed);
                        let err = FileError::PermanentDownload {
                            attempts: n,
                            last: reason.clone(),
                        };
                        warn!(name = %item.entry.name, error = %err, "download failed");
                        let _ = events.send(FileOutcome {
                            name: item.entry.name,
                            state: ItemState::PermanentlyFailed,
                            attempts: n,
                            bytes: 0,
                            error: Some(reason),
                        });
                    }
                }
            }
        }
    }
}

/// One attempt: stream the remote file into a temp file beside the
/// destination, verify length and hash, then rename into place. Any early
/// exit drops the temp file, so the destination is never half-written.
async fn download(shared: &Shared, item: &WorkItem, cancel: &CancellationToken) -> Result<u64, FileError> {
    let dest = &item.local_path;
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let url = shared.endpoint.file_url(&item.entry.name);
    let resp = tokio::select! {
        r = shared.client.get(url).send() => r?,
        _ = cancel.cancelled() => return Err(FileError::Cancelled),
    };
    let status = resp.status();
    if !status.is_success() {
        return Err(FileError::Transient(format!("HTTP {status}")));
    }
    let expected = resp.content_length();

    let (file, temp_path) = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(PART_SUFFIX)
        .tempfile_in(parent)?
        .into_parts();
    let mut writer = BufWriter::with_capacity(
        shared.settings.buffer_size,
        tokio::fs::File::from_std(file),
    );
    let mut hasher = ContentHasher::new();
    let mut body = resp.bytes_stream();
    loop {
        let chunk = tokio::select! {
            c = body.next() => c,
            _ = cancel.cancelled() => return Err(FileError::Cancelled),
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        hasher.update(&chunk);
        writer.write_all(&chunk).await?;
        shared.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    writer.flush().await?;
    writer.into_inner().sync_all().await?;

    let written = hasher.len();
    if let Some(len) = expected {
        if len != written {
            return Err(FileError::Transient(format!(
                "incomplete body: {written} of {len} bytes"
            )));
        }
    }
    let digest = hasher.finish();
    if !hashes_match(&digest, &item.entry.hash) {
        return Err(FileError::Transient(format!(
            "content hash {digest} does not match manifest {}",
            item.entry.hash
        )));
    }

    temp_path.persist(dest).map_err(|e| FileError::from(e.error))?;
    Ok(written)
}
