//! Typed transfer tasks, validated once when they come off the queue.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::TaskError;
use crate::protocol::{DEFAULT_TARGET_HOST, DEFAULT_TARGET_PORT};

/// Queue field names.
pub mod fields {
    pub const FILE_PATH: &str = "file_path";
    pub const TARGET_IP: &str = "target_ip";
    pub const PORT: &str = "port";
}

/// Opaque acknowledgment token assigned by the queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        TaskId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pool bucket: one remote endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
}

impl ConnectionKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A file to dispatch. Immutable once dequeued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub file_path: PathBuf,
    pub target_host: String,
    pub target_port: u16,
}

impl Task {
    /// Build a task from raw queue fields.
    ///
    /// `file_path` is required. `target_ip` defaults to loopback and `port`
    /// to 9000 when absent or empty.
    pub fn from_fields(id: TaskId, fields: &HashMap<String, String>) -> Result<Task, TaskError> {
        let file_path = match fields.get(fields::FILE_PATH).map(|s| s.trim()) {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => {
                return Err(TaskError::MissingField {
                    id: id.to_string(),
                    field: fields::FILE_PATH,
                })
            }
        };
        let target_host = fields
            .get(fields::TARGET_IP)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_TARGET_HOST)
            .to_string();
        let target_port = match fields.get(fields::PORT).map(|s| s.trim()) {
            Some(p) if !p.is_empty() => p.parse::<u16>().map_err(|_| TaskError::InvalidPort {
                id: id.to_string(),
                value: p.to_string(),
            })?,
            _ => DEFAULT_TARGET_PORT,
        };
        Ok(Task {
            id,
            file_path,
            target_host,
            target_port,
        })
    }

    /// Fields to append for this task, the inverse of [`Task::from_fields`].
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (fields::FILE_PATH, self.file_path.to_string_lossy().into_owned()),
            (fields::TARGET_IP, self.target_host.clone()),
            (fields::PORT, self.target_port.to_string()),
        ]
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.target_host.clone(), self.target_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_applied() {
        let t = Task::from_fields(TaskId::new("1-0"), &map(&[("file_path", "/tmp/a.bin")])).unwrap();
        assert_eq!(t.file_path, PathBuf::from("/tmp/a.bin"));
        assert_eq!(t.target_host, "127.0.0.1");
        assert_eq!(t.target_port, 9000);
        assert_eq!(t.key().to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn test_explicit_target() {
        let t = Task::from_fields(
            TaskId::new("2-0"),
            &map(&[("file_path", "x"), ("target_ip", "10.0.0.7"), ("port", "9991")]),
        )
        .unwrap();
        assert_eq!(t.key(), ConnectionKey::new("10.0.0.7", 9991));
    }

    #[test]
    fn test_missing_file_path_rejected() {
        let err = Task::from_fields(TaskId::new("3-0"), &map(&[("file_path", "  ")])).unwrap_err();
        assert_eq!(
            err,
            TaskError::MissingField {
                id: "3-0".into(),
                field: "file_path"
            }
        );
    }

    #[test]
    fn test_bad_port_rejected() {
        let err = Task::from_fields(
            TaskId::new("4-0"),
            &map(&[("file_path", "x"), ("port", "70000")]),
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::InvalidPort { .. }));
    }

    #[test]
    fn test_fields_round_trip() {
        let t = Task::from_fields(
            TaskId::new("5-0"),
            &map(&[("file_path", "/data/f"), ("target_ip", "h"), ("port", "1")]),
        )
        .unwrap();
        let raw: HashMap<String, String> = t
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(Task::from_fields(t.id.clone(), &raw).unwrap(), t);
    }
}
