//! The dispatch engine: one sequential loop from queue to wire and back.
//!
//! ```text
//! Idle -> Fetching -> per task: Resolving -> Acquiring -> Transferring -> Settling -> Idle
//! ```
//!
//! A task is acknowledged only after its frame was fully sent and the peer's
//! acknowledgment byte was read, or when its file is missing and the policy
//! says to skip it. Everything else leaves the task pending for redelivery
//! until the retry ceiling dead-letters it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::{DispatchConfig, MissingFilePolicy};
use crate::error::{QueueError, TransferError};
use crate::frame;
use crate::logger::Logger;
use crate::pool::ConnectionPool;
use crate::retry::{RetryDecision, RetryPolicy, RetryTracker};
use crate::source::TaskSource;
use crate::task::Task;

/// How a single task was settled.
#[derive(Debug)]
pub enum Outcome {
    Delivered { bytes: u64 },
    /// File absent; acknowledged without any connection attempt.
    MissingFile,
    /// Still inside its retry backoff; left pending untouched.
    Deferred,
    Failed { attempt: u32, error: TransferError },
    DeadLettered { attempts: u32 },
}

impl Outcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Outcome::Delivered { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub batches: u64,
    pub delivered: u64,
    pub bytes: u64,
    pub missing: u64,
    pub deferred: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub queue_errors: u64,
}

/// Engine context: owns the queue client, the connection pool and the retry
/// state for its whole lifetime.
pub struct Engine<S: TaskSource> {
    source: S,
    pool: ConnectionPool,
    retries: RetryTracker,
    config: DispatchConfig,
    logger: Arc<dyn Logger>,
    stats: DispatchStats,
}

impl<S: TaskSource> Engine<S> {
    pub fn new(source: S, config: DispatchConfig, logger: Arc<dyn Logger>) -> Self {
        Self {
            source,
            pool: ConnectionPool::new(config.pool.clone()),
            retries: RetryTracker::new(RetryPolicy::from(&config.retry)),
            config,
            logger,
            stats: DispatchStats::default(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Run until `shutdown` fires, then close every pooled connection.
    ///
    /// No single task or queue failure ends the loop.
    pub async fn run(&mut self, shutdown: CancellationToken) -> DispatchStats {
        let started = Instant::now();
        let backoff = Duration::from_millis(self.config.loop_backoff_ms);
        tracing::info!(
            batch_size = self.config.queue.batch_size,
            max_attempts = self.config.retry.max_attempts,
            "dispatch engine started"
        );
        while !shutdown.is_cancelled() {
            if let Err(e) = self.poll_once(&shutdown).await {
                self.stats.queue_errors += 1;
                tracing::warn!(error = %e, "loop error, backing off {:?}", backoff);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.cancelled() => {}
                }
            }
        }
        self.shutdown().await;
        self.logger.done(
            self.stats.delivered,
            self.stats.bytes,
            started.elapsed().as_secs_f64(),
        );
        tracing::info!(stats = ?self.stats, "dispatch engine stopped");
        self.stats
    }

    /// Fetch one batch and settle each task in order.
    pub async fn poll_once(&mut self, shutdown: &CancellationToken) -> Result<Vec<Outcome>, QueueError> {
        let forgotten = self.retries.prune(Instant::now());
        if forgotten > 0 {
            tracing::debug!(forgotten, "dropped retry state of tasks no longer redelivered");
        }
        let batch_size = self.config.queue.batch_size;
        let block = self.config.queue.block_timeout();
        let batch = tokio::select! {
            res = self.source.dequeue(batch_size, block) => res?,
            _ = shutdown.cancelled() => return Ok(Vec::new()),
        };
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        self.stats.batches += 1;
        let mut outcomes = Vec::with_capacity(batch.len());
        for task in &batch {
            if shutdown.is_cancelled() {
                tracing::info!(id = %task.id, "shutdown requested, leaving rest of batch pending");
                break;
            }
            outcomes.push(self.dispatch(task).await?);
        }
        Ok(outcomes)
    }

    /// Resolve, transfer and settle a single task.
    pub async fn dispatch(&mut self, task: &Task) -> Result<Outcome, QueueError> {
        let started = Instant::now();
        let missing = match tokio::fs::metadata(&task.file_path).await {
            Ok(md) => !md.is_file(),
            Err(e) => e.kind() == std::io::ErrorKind::NotFound,
        };
        if missing && self.config.retry.missing_file == MissingFilePolicy::Acknowledge {
            tracing::warn!(id = %task.id, path = %task.file_path.display(), "file not found, acknowledging");
            self.source.acknowledge(&task.id).await?;
            self.retries.clear(&task.id);
            self.logger.skipped(task, "file not found");
            self.stats.missing += 1;
            return Ok(Outcome::MissingFile);
        }

        if !self.retries.ready(&task.id) {
            tracing::debug!(id = %task.id, attempts = self.retries.attempts(&task.id), "in backoff, deferring");
            self.stats.deferred += 1;
            return Ok(Outcome::Deferred);
        }

        if missing {
            let err = TransferError::LocalIo {
                path: task.file_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            };
            return self.fail(task, err).await;
        }

        let key = task.key();
        let mut conn = match self.pool.acquire(&key).await {
            Ok(c) => c,
            Err(e) => return self.fail(task, e).await,
        };

        match frame::send_file(&mut conn, &task.file_path).await {
            Ok(bytes) => {
                self.pool.release(conn).await;
                self.source.acknowledge(&task.id).await?;
                self.retries.clear(&task.id);
                let elapsed = started.elapsed();
                tracing::info!(id = %task.id, path = %task.file_path.display(), target = %key, bytes, ?elapsed, "delivered");
                self.logger.delivered(task, bytes, elapsed);
                self.stats.delivered += 1;
                self.stats.bytes += bytes;
                Ok(Outcome::Delivered { bytes })
            }
            Err(e) => {
                self.pool.discard(conn).await;
                self.fail(task, e).await
            }
        }
    }

    async fn fail(&mut self, task: &Task, error: TransferError) -> Result<Outcome, QueueError> {
        let msg = error.to_string();
        match self.retries.record_failure(&task.id) {
            RetryDecision::Retry { attempt, after } => {
                if error.retryable() {
                    tracing::warn!(id = %task.id, attempt, retry_in = ?after, error = %msg, "transfer failed, leaving task pending");
                } else {
                    tracing::error!(id = %task.id, attempt, retry_in = ?after, error = %msg, "local error, leaving task pending");
                }
                self.logger.failed(task, attempt, &msg);
                self.stats.failed += 1;
                Ok(Outcome::Failed { attempt, error })
            }
            RetryDecision::GiveUp { attempts } => {
                tracing::error!(id = %task.id, attempts, error = %msg, "retry ceiling reached, dead-lettering");
                self.source
                    .dead_letter(task, &format!("{} failed attempts, last: {}", attempts, msg))
                    .await?;
                self.retries.clear(&task.id);
                self.logger.dead_lettered(task, attempts, &msg);
                self.stats.dead_lettered += 1;
                Ok(Outcome::DeadLettered { attempts })
            }
        }
    }

    /// Release every pooled connection.
    pub async fn shutdown(&mut self) {
        self.pool.close_all().await;
    }
}
