//! Error taxonomy for the dispatch engine and the receiver.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::task::ConnectionKey;

/// Failure of a single frame exchange, on either side of the wire.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The source file could not be opened or stat'd. The connection was not touched.
    #[error("cannot read source file {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("connect {key} failed: {source}")]
    Connect {
        key: ConnectionKey,
        #[source]
        source: io::Error,
    },

    #[error("connect {key} timed out after {ms} ms")]
    ConnectTimeout { key: ConnectionKey, ms: u64 },

    /// Short header or body, or the peer closed mid-frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A read or write stalled past its deadline. Never produced by a clean close.
    #[error("{stage} timed out after {ms} ms")]
    Timeout { stage: &'static str, ms: u64 },

    #[error("i/o error during {stage}: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    /// Classify an I/O error raised while a frame was in flight.
    pub(crate) fn from_io(stage: &'static str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => {
                TransferError::Protocol(format!("connection closed during {stage}: {e}"))
            }
            _ => TransferError::Io { stage, source: e },
        }
    }

    /// Whether leaving the task for redelivery can help.
    pub fn retryable(&self) -> bool {
        !matches!(self, TransferError::LocalIo { .. })
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, TransferError::Protocol(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransferError::Timeout { .. } | TransferError::ConnectTimeout { .. }
        )
    }
}

/// The queue could not be reached or rejected a command.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected queue reply: {0}")]
    Reply(String),
}

/// A queue entry that cannot become a [`crate::task::Task`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {id} has no `{field}` field")]
    MissingField { id: String, field: &'static str },

    #[error("task {id} has invalid port `{value}`")]
    InvalidPort { id: String, value: String },
}
