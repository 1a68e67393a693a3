//! TOML configuration for the dispatcher and the receiver.
//!
//! Every section is `#[serde(default)]`, so an empty or partial file is valid
//! and CLI flags are layered on top by the binaries.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{timeouts, DEFAULT_TARGET_PORT, RECV_CHUNK};

/// Redis Streams consumer-group settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSettings {
    pub redis_url: String,
    pub stream: String,
    pub group: String,
    /// Consumer identity; `<hostname>-<pid>` when unset.
    pub consumer: Option<String>,
    pub batch_size: usize,
    pub block_ms: u64,
    /// How often this consumer re-reads its own unacknowledged entries and
    /// claims idle ones from other consumers.
    pub reclaim_interval_secs: u64,
    /// Entries pending this long on any consumer are claimed (0 = never claim).
    pub claim_min_idle_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            stream: "transfer_tasks".to_string(),
            group: "filejet".to_string(),
            consumer: None,
            batch_size: 10,
            block_ms: timeouts::QUEUE_BLOCK_MS,
            reclaim_interval_secs: 30,
            claim_min_idle_secs: 300,
        }
    }
}

impl QueueSettings {
    pub fn consumer_name(&self) -> String {
        self.consumer.clone().unwrap_or_else(default_consumer_name)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn claim_min_idle(&self) -> Option<Duration> {
        (self.claim_min_idle_secs > 0).then(|| Duration::from_secs(self.claim_min_idle_secs))
    }
}

/// `<hostname>-<pid>`, unique per engine instance on a host. Entries a previous
/// process left pending are recovered by the idle claim, not by name reuse.
pub fn default_consumer_name() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "filejet".to_string());
    format!("{}-{}", host, std::process::id())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolSettings {
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_idle_per_key: usize,
    /// Idle connections older than this are closed instead of reused (0 = never expire).
    pub idle_expiry_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: timeouts::CONNECT_MS,
            io_timeout_ms: timeouts::IO_MS,
            ack_timeout_ms: timeouts::ACK_MS,
            max_idle_per_key: 4,
            idle_expiry_secs: 60,
        }
    }
}

/// What to do with a task whose file does not exist.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MissingFilePolicy {
    /// Acknowledge and skip; the input can never succeed.
    #[default]
    Acknowledge,
    /// Leave it pending for redelivery (the file may show up later).
    Leave,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    /// Failed attempts before a task is dead-lettered.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub missing_file: MissingFilePolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            missing_file: MissingFilePolicy::Acknowledge,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue: QueueSettings,
    pub pool: PoolSettings,
    pub retry: RetrySettings,
    pub loop_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue: QueueSettings::default(),
            pool: PoolSettings::default(),
            retry: RetrySettings::default(),
            loop_backoff_ms: timeouts::LOOP_BACKOFF_MS,
        }
    }
}

impl DispatchConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_toml(path)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReceiverConfig {
    pub bind: String,
    pub save_dir: PathBuf,
    pub read_chunk: usize,
    pub io_timeout_ms: u64,
    /// Close connections idle between frames for longer than this (0 = never).
    pub idle_timeout_secs: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{}", DEFAULT_TARGET_PORT),
            save_dir: PathBuf::from("./received_files"),
            read_chunk: RECV_CHUNK,
            io_timeout_ms: timeouts::IO_MS,
            idle_timeout_secs: 600,
        }
    }
}

impl ReceiverConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_toml(path)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

fn load_toml<T: Default + for<'de> Deserialize<'de>>(path: Option<&Path>) -> Result<T> {
    let Some(p) = path else {
        return Ok(T::default());
    };
    let data = std::fs::read_to_string(p)
        .with_context(|| format!("Failed to read config file: {}", p.display()))?;
    toml::from_str(&data).with_context(|| format!("Failed to parse config file: {}", p.display()))
}
