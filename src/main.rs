//! filejet - queue-driven file dispatcher
//!
//! `filejet run` consumes transfer tasks and delivers each file to its
//! receiver; `filejet enqueue` appends a task for testing and scripting.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use filejet::cli::{init_tracing, open_logger, DispatchOpts, EnqueueOpts};
use filejet::source::RedisStreamSource;
use filejet::task::fields;
use filejet::Engine;

#[derive(Parser, Debug)]
#[command(
    name = "filejet",
    author,
    version,
    about = "Delivers files listed in a Redis stream to TCP receivers"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dispatch engine until interrupted
    Run(DispatchOpts),
    /// Append one transfer task to the stream
    Enqueue(EnqueueOpts),
}

fn main() -> Result<()> {
    let args = Args::parse();
    let verbose = match &args.command {
        Command::Run(o) => o.verbose,
        Command::Enqueue(_) => 0,
    };
    init_tracing(verbose);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match args.command {
        Command::Run(opts) => rt.block_on(run(opts)),
        Command::Enqueue(opts) => rt.block_on(enqueue(opts)),
    }
}

fn install_ctrlc(token: CancellationToken) -> Result<()> {
    let interrupted = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            eprintln!("\nInterrupted twice. Exiting (Ctrl-C)...");
            std::process::exit(130);
        }
        eprintln!("\nInterrupted by user. Finishing current transfer (Ctrl-C again to force)...");
        token.cancel();
    })
    .context("Error setting Ctrl-C handler")
}

async fn run(opts: DispatchOpts) -> Result<()> {
    let config = opts.load_config()?;
    let logger = open_logger(opts.log_file.as_deref());

    let source = RedisStreamSource::connect(&config.queue)
        .await
        .with_context(|| format!("Failed to connect to queue at {}", config.queue.redis_url))?;
    tracing::info!(
        stream = %config.queue.stream,
        group = %config.queue.group,
        consumer = %source.consumer(),
        "consuming transfer tasks"
    );

    let shutdown = CancellationToken::new();
    install_ctrlc(shutdown.clone())?;

    let mut engine = Engine::new(source, config, logger);
    let stats = engine.run(shutdown).await;
    println!(
        "Delivered {} files ({} bytes); {} missing, {} failed attempts, {} dead-lettered",
        stats.delivered, stats.bytes, stats.missing, stats.failed, stats.dead_lettered
    );
    Ok(())
}

async fn enqueue(opts: EnqueueOpts) -> Result<()> {
    let config = opts.load_config()?;
    let path = std::path::absolute(&opts.file)
        .with_context(|| format!("Failed to resolve path: {}", opts.file.display()))?;
    if !path.is_file() {
        tracing::warn!(path = %path.display(), "file does not exist (yet); enqueueing anyway");
    }
    let mut source = RedisStreamSource::connect(&config.queue)
        .await
        .with_context(|| format!("Failed to connect to queue at {}", config.queue.redis_url))?;
    let entry = [
        (fields::FILE_PATH, path.to_string_lossy().into_owned()),
        (fields::TARGET_IP, opts.host.clone()),
        (fields::PORT, opts.port.to_string()),
    ];
    let id = source.enqueue(&entry).await?;
    println!("{}", id);
    Ok(())
}
