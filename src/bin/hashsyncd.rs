use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use hashsync::cli::{init_tracing, DaemonOpts};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(opts.verbose);

    let config = opts.server_config().context("Invalid server configuration")?;

    // Validate root directory exists and is a directory
    if !config.root.exists() {
        anyhow::bail!("Root directory does not exist: {}", config.root.display());
    }
    if !config.root.is_dir() {
        anyhow::bail!("Root path is not a directory: {}", config.root.display());
    }
    let canonical_root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;

    println!("Starting hashsync daemon:");
    println!("  Root:  {}", canonical_root.display());
    println!("  Bind:  {}", config.bind);
    println!("  Cache: {}", config.cache_path.display());
    match config.max_concurrent_transfers {
        0 => println!("  Transfers: unlimited"),
        n => println!("  Transfers: {n} ({:?} when busy)", config.admission),
    }

    if config.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the daemon on all network interfaces");
        eprintln!("   Manifest and file routes are unauthenticated; only use on trusted networks");
        eprintln!();
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nShutting down (Ctrl-C)...");
            cancel.cancel();
        })
        .context("Error setting Ctrl-C handler")?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(hashsync::server::run(config, cancel))
        .context("Server stopped with an error")
}
