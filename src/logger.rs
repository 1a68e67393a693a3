use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::task::Task;

/// Audit trail of task settlements and received files.
///
/// Diagnostics go through `tracing`; this is the durable per-transfer record
/// enabled with `--log-file`.
pub trait Logger: Send + Sync {
    fn delivered(&self, _task: &Task, _bytes: u64, _elapsed: Duration) {}
    fn skipped(&self, _task: &Task, _reason: &str) {}
    fn failed(&self, _task: &Task, _attempt: u32, _msg: &str) {}
    fn dead_lettered(&self, _task: &Task, _attempts: u32, _msg: &str) {}
    fn received(&self, _peer: &SocketAddr, _path: &Path, _bytes: u64) {}
    fn done(&self, _delivered: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn delivered(&self, task: &Task, bytes: u64, elapsed: Duration) {
        self.line(&format!(
            "DELIVERED id={} path={} target={} bytes={} seconds={:.3}",
            task.id,
            task.file_path.display(),
            task.key(),
            bytes,
            elapsed.as_secs_f64()
        ));
    }
    fn skipped(&self, task: &Task, reason: &str) {
        self.line(&format!(
            "SKIPPED id={} path={} reason={}",
            task.id,
            task.file_path.display(),
            reason
        ));
    }
    fn failed(&self, task: &Task, attempt: u32, msg: &str) {
        self.line(&format!(
            "FAILED id={} path={} target={} attempt={} msg={}",
            task.id,
            task.file_path.display(),
            task.key(),
            attempt,
            msg
        ));
    }
    fn dead_lettered(&self, task: &Task, attempts: u32, msg: &str) {
        self.line(&format!(
            "DEAD id={} path={} attempts={} msg={}",
            task.id,
            task.file_path.display(),
            attempts,
            msg
        ));
    }
    fn received(&self, peer: &SocketAddr, path: &Path, bytes: u64) {
        self.line(&format!(
            "RECEIVED peer={} path={} bytes={}",
            peer,
            path.display(),
            bytes
        ));
    }
    fn done(&self, delivered: u64, bytes: u64, seconds: f64) {
        self.line(&format!(
            "DONE delivered={delivered} bytes={bytes} seconds={seconds:.3}"
        ));
    }
}
