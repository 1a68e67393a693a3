//! In-process queue with consumer-group style delivery.
//!
//! Entries are delivered once, then stay pending until acknowledged. A
//! pending entry is delivered again once `redeliver_after` has passed since
//! its last delivery.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::TaskSource;
use crate::error::QueueError;
use crate::task::{fields, Task, TaskId};

struct Entry {
    id: TaskId,
    fields: HashMap<String, String>,
}

struct Pending {
    entry: Entry,
    delivered_at: Instant,
}

struct State {
    next_seq: u64,
    fresh: VecDeque<Entry>,
    pending: Vec<Pending>,
    deliveries: HashMap<TaskId, u32>,
    acked: Vec<TaskId>,
    dead: Vec<(TaskId, String)>,
    redeliver_after: Duration,
    unavailable: Option<String>,
}

impl State {
    fn take(&mut self, batch_size: usize) -> Vec<Task> {
        let now = Instant::now();
        let mut out = Vec::new();
        while out.len() < batch_size {
            let Some(entry) = self.fresh.pop_front() else {
                break;
            };
            match Task::from_fields(entry.id.clone(), &entry.fields) {
                Ok(task) => {
                    *self.deliveries.entry(entry.id.clone()).or_default() += 1;
                    self.pending.push(Pending {
                        entry,
                        delivered_at: now,
                    });
                    out.push(task);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed queue entry");
                    self.dead.push((entry.id, e.to_string()));
                }
            }
        }
        for p in self.pending.iter_mut() {
            if out.len() >= batch_size {
                break;
            }
            if now.duration_since(p.delivered_at) < self.redeliver_after
                || out.iter().any(|t| t.id == p.entry.id)
            {
                continue;
            }
            if let Ok(task) = Task::from_fields(p.entry.id.clone(), &p.entry.fields) {
                p.delivered_at = now;
                *self.deliveries.entry(p.entry.id.clone()).or_default() += 1;
                out.push(task);
            }
        }
        out
    }

    fn next_redelivery_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.pending
            .iter()
            .map(|p| (p.delivered_at + self.redeliver_after).saturating_duration_since(now))
            .min()
    }
}

/// Clonable handle; all clones share one queue.
#[derive(Clone)]
pub struct MemorySource {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl MemorySource {
    pub fn new(redeliver_after: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_seq: 1,
                fresh: VecDeque::new(),
                pending: Vec::new(),
                deliveries: HashMap::new(),
                acked: Vec::new(),
                dead: Vec::new(),
                redeliver_after,
                unavailable: None,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append a raw entry; returns its id (`<seq>-0`).
    pub fn push(&self, fields: HashMap<String, String>) -> TaskId {
        let id = {
            let mut st = self.state.lock();
            let id = TaskId::new(format!("{}-0", st.next_seq));
            st.next_seq += 1;
            st.fresh.push_back(Entry {
                id: id.clone(),
                fields,
            });
            id
        };
        self.notify.notify_waiters();
        id
    }

    pub fn push_task(&self, path: &Path, host: &str, port: u16) -> TaskId {
        let mut f = HashMap::new();
        f.insert(fields::FILE_PATH.to_string(), path.to_string_lossy().into_owned());
        f.insert(fields::TARGET_IP.to_string(), host.to_string());
        f.insert(fields::PORT.to_string(), port.to_string());
        self.push(f)
    }

    /// Make every dequeue fail until cleared.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.state.lock().unavailable = reason.map(str::to_string);
        self.notify.notify_waiters();
    }

    pub fn acked(&self) -> Vec<TaskId> {
        self.state.lock().acked.clone()
    }

    pub fn is_acked(&self, id: &TaskId) -> bool {
        self.state.lock().acked.contains(id)
    }

    pub fn dead_letters(&self) -> Vec<(TaskId, String)> {
        self.state.lock().dead.clone()
    }

    /// Delivered but not yet acknowledged.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn deliveries(&self, id: &TaskId) -> u32 {
        self.state.lock().deliveries.get(id).copied().unwrap_or(0)
    }

    fn settle(&self, id: &TaskId) -> bool {
        let mut st = self.state.lock();
        let before = st.pending.len();
        st.pending.retain(|p| &p.entry.id != id);
        before != st.pending.len()
    }
}

#[async_trait]
impl TaskSource for MemorySource {
    async fn dequeue(&mut self, batch_size: usize, block: Duration) -> Result<Vec<Task>, QueueError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.notify.notified();
            let wait = {
                let mut st = self.state.lock();
                if let Some(reason) = &st.unavailable {
                    return Err(QueueError::Unavailable(reason.clone()));
                }
                let tasks = st.take(batch_size.max(1));
                if !tasks.is_empty() {
                    return Ok(tasks);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(Vec::new());
                }
                let left = deadline - now;
                st.next_redelivery_in().map_or(left, |d| d.min(left))
            };
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn acknowledge(&mut self, id: &TaskId) -> Result<(), QueueError> {
        if self.settle(id) {
            self.state.lock().acked.push(id.clone());
        }
        Ok(())
    }

    async fn dead_letter(&mut self, task: &Task, reason: &str) -> Result<(), QueueError> {
        if self.settle(&task.id) {
            self.state.lock().dead.push((task.id.clone(), reason.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_dequeue_times_out() {
        let mut q = MemorySource::default();
        let started = Instant::now();
        let got = q.dequeue(10, Duration::from_millis(50)).await.unwrap();
        assert!(got.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_push_wakes_blocked_dequeue() {
        let mut q = MemorySource::default();
        let producer = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.push_task(Path::new("/tmp/x"), "127.0.0.1", 9000);
        });
        let got = q.dequeue(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id.as_str(), "1-0");
    }

    #[tokio::test]
    async fn test_unacked_is_redelivered() {
        let mut q = MemorySource::new(Duration::from_millis(20));
        let id = q.push_task(Path::new("/tmp/a"), "127.0.0.1", 9000);
        assert_eq!(q.dequeue(1, Duration::ZERO).await.unwrap().len(), 1);
        let again = q.dequeue(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(again[0].id, id);
        assert_eq!(q.deliveries(&id), 2);
        q.acknowledge(&id).await.unwrap();
        q.acknowledge(&id).await.unwrap();
        assert_eq!(q.acked(), vec![id]);
        assert_eq!(q.pending_count(), 0);
        assert!(q.dequeue(1, Duration::from_millis(40)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_respected() {
        let mut q = MemorySource::default();
        for i in 0..5 {
            q.push_task(Path::new(&format!("/tmp/{i}")), "h", 1);
        }
        assert_eq!(q.dequeue(3, Duration::ZERO).await.unwrap().len(), 3);
        assert_eq!(q.dequeue(3, Duration::ZERO).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_entry_never_delivered() {
        let mut q = MemorySource::default();
        let mut raw = HashMap::new();
        raw.insert("port".to_string(), "9000".to_string());
        let bad = q.push(raw);
        assert!(q.dequeue(10, Duration::ZERO).await.unwrap().is_empty());
        let dead = q.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, bad);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let mut q = MemorySource::default();
        q.set_unavailable(Some("down"));
        assert!(matches!(
            q.dequeue(1, Duration::ZERO).await,
            Err(QueueError::Unavailable(_))
        ));
        q.set_unavailable(None);
        assert!(q.dequeue(1, Duration::ZERO).await.unwrap().is_empty());
    }
}
