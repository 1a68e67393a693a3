//! Task sources: the narrow dequeue/acknowledge view of the external queue.
//!
//! The engine never sees raw queue entries. Sources validate entries into
//! [`Task`]s at dequeue time and dead-letter the ones that cannot be parsed.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::task::{Task, TaskId};

pub mod memory;
pub mod redis_stream;

pub use memory::MemorySource;
pub use redis_stream::RedisStreamSource;

#[async_trait]
pub trait TaskSource: Send {
    /// Up to `batch_size` pending tasks for this consumer.
    ///
    /// Returns an empty batch when nothing arrives within `block`.
    async fn dequeue(&mut self, batch_size: usize, block: Duration) -> Result<Vec<Task>, QueueError>;

    /// Mark a task complete. Acknowledging twice is not an error.
    async fn acknowledge(&mut self, id: &TaskId) -> Result<(), QueueError>;

    /// Give up on a task that keeps failing.
    async fn dead_letter(&mut self, task: &Task, reason: &str) -> Result<(), QueueError> {
        tracing::warn!(id = %task.id, reason, "dead-lettering by acknowledgment");
        self.acknowledge(&task.id).await
    }
}
