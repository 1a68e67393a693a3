//! Shared CLI helpers and reusable Clap fragments for `filejet` and `filejetd`

use anyhow::Result;
use clap::{ArgAction, Args, Parser};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{DispatchConfig, MissingFilePolicy, ReceiverConfig};
use crate::logger::{Logger, NoopLogger, TextLogger};
use crate::protocol::{DEFAULT_TARGET_HOST, DEFAULT_TARGET_PORT};

/// Dispatch engine options; flags override the TOML file.
#[derive(Clone, Debug, Args)]
pub struct DispatchOpts {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Redis connection URL
    #[arg(long = "redis-url")]
    pub redis_url: Option<String>,

    /// Stream holding transfer tasks
    #[arg(long)]
    pub stream: Option<String>,

    /// Consumer group name
    #[arg(long)]
    pub group: Option<String>,

    /// Consumer name (default: <hostname>-<pid>)
    #[arg(long)]
    pub consumer: Option<String>,

    /// Tasks fetched per queue read
    #[arg(long = "batch-size")]
    pub batch_size: Option<usize>,

    /// What to do with tasks whose file does not exist
    #[arg(long = "missing-file", value_enum)]
    pub missing_file: Option<MissingFilePolicy>,

    /// Append one line per settled task to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// More diagnostics (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl DispatchOpts {
    pub fn load_config(&self) -> Result<DispatchConfig> {
        let mut cfg = DispatchConfig::load(self.config.as_deref())?;
        if let Some(v) = &self.redis_url {
            cfg.queue.redis_url = v.clone();
        }
        if let Some(v) = &self.stream {
            cfg.queue.stream = v.clone();
        }
        if let Some(v) = &self.group {
            cfg.queue.group = v.clone();
        }
        if let Some(v) = &self.consumer {
            cfg.queue.consumer = Some(v.clone());
        }
        if let Some(v) = self.batch_size {
            cfg.queue.batch_size = v.max(1);
        }
        if let Some(v) = self.missing_file {
            cfg.retry.missing_file = v;
        }
        Ok(cfg)
    }
}

/// Producer side: append one task to the stream.
#[derive(Clone, Debug, Args)]
pub struct EnqueueOpts {
    /// File to transfer (made absolute before enqueueing)
    pub file: PathBuf,

    /// Receiver host
    #[arg(long, default_value = DEFAULT_TARGET_HOST)]
    pub host: String,

    /// Receiver port
    #[arg(long, default_value_t = DEFAULT_TARGET_PORT)]
    pub port: u16,

    #[arg(long = "redis-url")]
    pub redis_url: Option<String>,

    #[arg(long)]
    pub stream: Option<String>,

    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl EnqueueOpts {
    pub fn load_config(&self) -> Result<DispatchConfig> {
        let mut cfg = DispatchConfig::load(self.config.as_deref())?;
        if let Some(v) = &self.redis_url {
            cfg.queue.redis_url = v.clone();
        }
        if let Some(v) = &self.stream {
            cfg.queue.stream = v.clone();
        }
        Ok(cfg)
    }
}

/// Receiver daemon options
#[derive(Clone, Debug, Parser)]
#[command(name = "filejetd", version, about = "Receives framed files and writes them to disk")]
pub struct ReceiverOpts {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory for received files
    #[arg(long = "save-dir")]
    pub save_dir: Option<PathBuf>,

    /// Append one line per received file to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl ReceiverOpts {
    pub fn load_config(&self) -> Result<ReceiverConfig> {
        let mut cfg = ReceiverConfig::load(self.config.as_deref())?;
        if let Some(v) = &self.bind {
            cfg.bind = v.clone();
        }
        if let Some(v) = &self.save_dir {
            cfg.save_dir = v.clone();
        }
        Ok(cfg)
    }
}

/// Install the `tracing` subscriber; `RUST_LOG` wins over `-v`.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "filejet=info",
        1 => "filejet=debug",
        _ => "filejet=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}

/// Choose the audit logger once; a log file that cannot be opened is not fatal.
pub fn open_logger(path: Option<&Path>) -> Arc<dyn Logger> {
    match path {
        Some(p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                tracing::warn!(path = %p.display(), error = %e, "cannot open log file, continuing without it");
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    }
}
