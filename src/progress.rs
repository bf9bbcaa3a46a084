//! Progress reporting
//!
//! The sync core never touches presentation state. It pushes phase changes,
//! per-file outcomes and periodic snapshots into a single [`ProgressSink`];
//! the CLI plugs in a cargo-style terminal display, tests plug in recorders.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::sync::SyncReport;
use crate::work::{FileOutcome, ItemState, ProgressSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    FetchingManifest,
    Comparing { entries: usize },
    Downloading { files: usize },
}

pub trait ProgressSink: Send {
    fn phase(&mut self, _phase: Phase) {}
    fn progress(&mut self, _snapshot: &ProgressSnapshot) {}
    fn file_finished(&mut self, _outcome: &FileOutcome) {}
    fn done(&mut self, _report: &SyncReport) {}
}

pub struct NoopSink;
impl ProgressSink for NoopSink {}

/// Feed two sinks from one run
pub struct Tee<A, B>(pub A, pub B);

impl<A: ProgressSink, B: ProgressSink> ProgressSink for Tee<A, B> {
    fn phase(&mut self, phase: Phase) {
        self.0.phase(phase);
        self.1.phase(phase);
    }
    fn progress(&mut self, snapshot: &ProgressSnapshot) {
        self.0.progress(snapshot);
        self.1.progress(snapshot);
    }
    fn file_finished(&mut self, outcome: &FileOutcome) {
        self.0.file_finished(outcome);
        self.1.file_finished(outcome);
    }
    fn done(&mut self, report: &SyncReport) {
        self.0.done(report);
        self.1.done(report);
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for Box<S> {
    fn phase(&mut self, phase: Phase) {
        (**self).phase(phase)
    }
    fn progress(&mut self, snapshot: &ProgressSnapshot) {
        (**self).progress(snapshot)
    }
    fn file_finished(&mut self, outcome: &FileOutcome) {
        (**self).file_finished(outcome)
    }
    fn done(&mut self, report: &SyncReport) {
        (**self).done(report)
    }
}

/// Cargo-style display: file operations scroll above, one status line stays
/// at the bottom.
pub struct TerminalProgress {
    bar: ProgressBar,
    start_time: Instant,
    show_files: bool,
}

impl TerminalProgress {
    pub fn new(verbose: bool) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            start_time: Instant::now(),
            show_files: verbose,
        }
    }

    fn print_file_op(&self, operation: &str, path: &str) {
        if self.show_files {
            self.bar.suspend(|| println!("  {operation:>10} {path}"));
        }
    }
}

impl ProgressSink for TerminalProgress {
    fn phase(&mut self, phase: Phase) {
        let msg = match phase {
            Phase::FetchingManifest => "Fetching manifest".to_string(),
            Phase::Comparing { entries } => format!("Comparing {entries} entries"),
            Phase::Downloading { files } => format!("Downloading {files} files"),
        };
        self.bar.set_message(msg);
    }

    fn progress(&mut self, snap: &ProgressSnapshot) {
        let throughput = if snap.elapsed.as_secs_f64() > 0.1 {
            format!(" @ {:.1} MB/s", snap.throughput() / 1_048_576.0)
        } else {
            String::new()
        };
        self.bar.set_message(format!(
            "Downloading ({}/{}) {:.1} MB in {:.1}s{}",
            snap.finished(),
            snap.total,
            snap.bytes as f64 / 1_048_576.0,
            snap.elapsed.as_secs_f64(),
            throughput
        ));
    }

    fn file_finished(&mut self, outcome: &FileOutcome) {
        match outcome.state {
            ItemState::Success => self.print_file_op("Fetched", &outcome.name),
            _ => {
                let reason = outcome.error.as_deref().unwrap_or("unknown error");
                self.bar
                    .suspend(|| eprintln!("  {:>10} {} ({reason})", "Failed", outcome.name));
            }
        }
    }

    fn done(&mut self, report: &SyncReport) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let verdict = if report.cancelled {
            "Cancelled"
        } else if report.failures.is_empty() {
            "Completed"
        } else {
            "Finished with errors"
        };
        self.bar.finish_with_message(format!(
            "{verdict}: {} of {} files ({:.1} MB) in {:.1}s",
            report.downloaded,
            report.queued,
            report.bytes as f64 / 1_048_576.0,
            elapsed
        ));
    }
}
