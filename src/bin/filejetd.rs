use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use filejet::cli::{init_tracing, open_logger, ReceiverOpts};
use filejet::Receiver;

fn main() -> Result<()> {
    let opts = ReceiverOpts::parse();
    init_tracing(opts.verbose);
    let config = opts.load_config()?;

    println!("Starting filejet receiver:");
    println!("  Save dir: {}", config.save_dir.display());
    println!("  Bind: {}", config.bind);

    if config.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the receiver to all network interfaces");
        eprintln!("   The protocol is unencrypted and unauthenticated; only use on trusted networks");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let logger = open_logger(opts.log_file.as_deref());
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let interrupted = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\nInterrupted by user. Waiting for open transfers (Ctrl-C again to force)...");
        token.cancel();
    })
    .context("Error setting Ctrl-C handler")?;

    rt.block_on(async move {
        let receiver = Receiver::bind(config, logger).await?;
        receiver.serve(shutdown).await
    })
}
