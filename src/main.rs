//! hashsync - bring a local directory in line with a remote manifest
//!
//! Fetches the server's manifest, hashes the local tree against it and
//! downloads only what is missing or stale. Files the manifest does not name
//! are never touched.

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use hashsync::cli::{init_tracing, SyncOpts};
use hashsync::progress::{ProgressSink, Tee, TerminalProgress};
use hashsync::report::TransferReport;
use hashsync::Syncer;

fn main() -> Result<()> {
    let opts = SyncOpts::parse();
    init_tracing(opts.verbose);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            if cancel.is_cancelled() {
                eprintln!("\nInterrupted twice. Exiting immediately (Ctrl-C)...");
                std::process::exit(130);
            }
            eprintln!("\nInterrupted by user. Finishing in-flight work (Ctrl-C again to force)...");
            cancel.cancel();
        })
        .context("Error setting Ctrl-C handler")?;
    }

    let config = opts.client_config().context("Invalid client configuration")?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let syncer = Syncer::new(config).context("Failed to set up sync client")?;

    if opts.dry_run {
        let plan = rt
            .block_on(syncer.plan(&cancel))
            .context("Failed to compare against remote manifest")?;
        for item in &plan.items {
            println!("{}", item.entry.name);
        }
        for rejected in &plan.rejected {
            eprintln!("  {:>10} {} ({})", "Skipped", rejected.name, rejected.reason);
        }
        eprintln!(
            "{} of {} entries would be downloaded",
            plan.items.len(),
            plan.examined
        );
        return Ok(());
    }

    let mut sink: Box<dyn ProgressSink> = Box::new(TerminalProgress::new(opts.progress));
    if let Some(path) = &syncer.config().report_file {
        let report = TransferReport::create(path)?;
        sink = Box::new(Tee(sink, report));
    }

    let report = rt
        .block_on(syncer.run(sink.as_mut(), &cancel))
        .context("Sync aborted")?;

    if report.cancelled {
        std::process::exit(130);
    }
    if !report.failures.is_empty() {
        eprintln!("\n{} file(s) could not be synced:", report.failures.len());
        for failure in &report.failures {
            eprintln!(
                "  {} after {} attempt(s): {}",
                failure.name, failure.attempts, failure.reason
            );
        }
        std::process::exit(1);
    }
    Ok(())
}
