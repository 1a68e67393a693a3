//! filejet
//!
//! Queue-driven file delivery: a dispatch engine pulls transfer tasks from a
//! Redis Streams consumer group and pushes each file as one length-prefixed
//! frame over pooled TCP connections; the receiver persists every frame and
//! acknowledges it.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod logger;
pub mod pool;
pub mod protocol;
pub mod receiver;
pub mod retry;
pub mod source;
pub mod task;

pub use dispatch::{DispatchStats, Engine, Outcome};
pub use error::{QueueError, TaskError, TransferError};
pub use receiver::Receiver;
pub use task::{ConnectionKey, Task, TaskId};
