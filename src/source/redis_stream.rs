//! Redis Streams consumer-group adapter.
//!
//! New entries come from `XREADGROUP ... >`. Every `reclaim_interval` the
//! consumer first re-reads its own pending list (`XREADGROUP ... 0`), then
//! claims entries that sat unacknowledged on any consumer for at least
//! `claim_min_idle` (`XAUTOCLAIM`). The claim is what recovers work left
//! behind by a crashed or restarted engine, whose consumer name is gone.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult, Value};

use super::TaskSource;
use crate::config::QueueSettings;
use crate::error::QueueError;
use crate::task::{Task, TaskId};

/// Cursor value that starts (and ends) a full `XAUTOCLAIM` scan.
const CLAIM_START: &str = "0-0";

/// One stream entry as read off the wire.
#[derive(Debug)]
pub(crate) struct RawEntry {
    pub id: String,
    pub fields: HashMap<String, Value>,
}

/// What to do with a raw entry.
#[derive(Debug, PartialEq)]
pub(crate) enum Decoded {
    Ready(Task),
    /// Still pending but its body was trimmed from the stream.
    Trimmed(TaskId),
    /// Cannot become a task; `dead` is the dead-letter entry to append.
    Malformed {
        id: TaskId,
        dead: Vec<(String, String)>,
    },
}

pub(crate) fn decode_entry(entry: RawEntry) -> Decoded {
    let id = TaskId::new(entry.id);
    if entry.fields.is_empty() {
        return Decoded::Trimmed(id);
    }
    let raw = string_fields(&entry.fields);
    match Task::from_fields(id.clone(), &raw) {
        Ok(task) => Decoded::Ready(task),
        Err(e) => Decoded::Malformed {
            dead: dead_entry(raw, &id, &e.to_string()),
            id,
        },
    }
}

/// Dead-letter entry: the original fields (sorted by name), then `reason` and `source_id`.
pub(crate) fn dead_entry(
    fields: impl IntoIterator<Item = (String, String)>,
    id: &TaskId,
    reason: &str,
) -> Vec<(String, String)> {
    let mut entry: Vec<(String, String)> = fields.into_iter().collect();
    entry.sort();
    entry.push(("reason".to_string(), reason.to_string()));
    entry.push(("source_id".to_string(), id.to_string()));
    entry
}

/// String-valued fields of a stream entry; non-string values are skipped.
pub(crate) fn string_fields(map: &HashMap<String, Value>) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect()
}

fn bad_reply(what: &str) -> QueueError {
    QueueError::Reply(format!("XAUTOCLAIM: {}", what))
}

/// Parse an `XAUTOCLAIM` reply into the next cursor and the claimed entries.
///
/// Entries deleted from the stream come back with a nil body (Redis 6.2) and
/// decode as trimmed; the trailing deleted-id list of Redis 7 is ignored.
pub(crate) fn parse_autoclaim(reply: Value) -> Result<(String, Vec<RawEntry>), QueueError> {
    let Value::Array(parts) = reply else {
        return Err(bad_reply("not an array"));
    };
    let mut parts = parts.into_iter();
    let cursor: String = parts
        .next()
        .and_then(|v| redis::from_redis_value(&v).ok())
        .ok_or_else(|| bad_reply("missing cursor"))?;
    let items = match parts.next() {
        Some(Value::Array(items)) => items,
        _ => return Err(bad_reply("missing entry list")),
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let Value::Array(pair) = item else {
            continue;
        };
        let mut pair = pair.into_iter();
        let Some(id) = pair.next().and_then(|v| redis::from_redis_value::<String>(&v).ok()) else {
            return Err(bad_reply("entry without id"));
        };
        let mut fields = HashMap::new();
        if let Some(Value::Array(kv)) = pair.next() {
            let mut kv = kv.into_iter();
            while let (Some(k), Some(v)) = (kv.next(), kv.next()) {
                if let Ok(k) = redis::from_redis_value::<String>(&k) {
                    fields.insert(k, v);
                }
            }
        }
        entries.push(RawEntry { id, fields });
    }
    Ok((cursor, entries))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReadStep {
    OwnPending,
    ClaimIdle,
    New,
}

/// When the pending list and idle claims are due again.
#[derive(Debug)]
pub(crate) struct ReclaimSchedule {
    every: Duration,
    claim: bool,
    last: Option<Instant>,
}

impl ReclaimSchedule {
    pub(crate) fn new(every: Duration, claim: bool) -> Self {
        Self {
            every,
            claim,
            last: None,
        }
    }

    /// Reads to try in order; the first non-empty batch wins. Due from the
    /// first call, so a fresh process recovers leftovers before new work.
    pub(crate) fn plan(&mut self, now: Instant) -> Vec<ReadStep> {
        let due = self
            .last
            .map_or(true, |t| now.saturating_duration_since(t) >= self.every);
        if !due {
            return vec![ReadStep::New];
        }
        self.last = Some(now);
        let mut steps = vec![ReadStep::OwnPending];
        if self.claim {
            steps.push(ReadStep::ClaimIdle);
        }
        steps.push(ReadStep::New);
        steps
    }
}

pub struct RedisStreamSource {
    con: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
    claim_min_idle: Option<Duration>,
    claim_cursor: String,
    schedule: ReclaimSchedule,
}

impl RedisStreamSource {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(settings: &QueueSettings) -> Result<Self, QueueError> {
        let client = redis::Client::open(settings.redis_url.as_str())?;
        let mut con = client.get_multiplexed_async_connection().await?;
        let created: RedisResult<()> = con
            .xgroup_create_mkstream(&settings.stream, &settings.group, "$")
            .await;
        match created {
            Ok(()) => tracing::info!(stream = %settings.stream, group = %settings.group, "created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }
        let claim_min_idle = settings.claim_min_idle();
        Ok(Self {
            con,
            stream: settings.stream.clone(),
            group: settings.group.clone(),
            consumer: settings.consumer_name(),
            claim_min_idle,
            claim_cursor: CLAIM_START.to_string(),
            schedule: ReclaimSchedule::new(
                Duration::from_secs(settings.reclaim_interval_secs),
                claim_min_idle.is_some(),
            ),
        })
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn dead_letter_stream(&self) -> String {
        format!("{}:dead", self.stream)
    }

    /// Append a task entry to the stream (producer side).
    pub async fn enqueue(&mut self, task_fields: &[(&str, String)]) -> Result<TaskId, QueueError> {
        let id: String = self.con.xadd(&self.stream, "*", task_fields).await?;
        Ok(TaskId::new(id))
    }

    async fn read(
        &mut self,
        from: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Task>, QueueError> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count);
        if let Some(b) = block {
            // BLOCK 0 would wait forever
            opts = opts.block((b.as_millis() as usize).max(1));
        }
        let reply: Option<StreamReadReply> = self
            .con
            .xread_options(&[&self.stream], &[from], &opts)
            .await?;
        let entries = reply
            .map(|r| {
                r.keys
                    .into_iter()
                    .flat_map(|k| k.ids)
                    .map(|e| RawEntry {
                        id: e.id,
                        fields: e.map,
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.admit(entries).await
    }

    /// Take over entries idle on any consumer, resuming the previous scan.
    async fn claim_idle(&mut self, count: usize) -> Result<Vec<Task>, QueueError> {
        let Some(min_idle) = self.claim_min_idle else {
            return Ok(Vec::new());
        };
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(&self.claim_cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.con)
            .await?;
        let (cursor, entries) = parse_autoclaim(reply)?;
        self.claim_cursor = cursor;
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), consumer = %self.consumer, "claimed idle entries");
        }
        self.admit(entries).await
    }

    async fn admit(&mut self, entries: Vec<RawEntry>) -> Result<Vec<Task>, QueueError> {
        let mut tasks = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode_entry(entry) {
                Decoded::Ready(task) => tasks.push(task),
                Decoded::Trimmed(id) => {
                    tracing::warn!(%id, "pending entry no longer in stream, acknowledging");
                    self.acknowledge(&id).await?;
                }
                Decoded::Malformed { id, dead } => {
                    tracing::warn!(%id, "malformed queue entry, dead-lettering");
                    self.move_to_dead(&id, &dead).await?;
                }
            }
        }
        Ok(tasks)
    }

    async fn move_to_dead(&mut self, id: &TaskId, entry: &[(String, String)]) -> Result<(), QueueError> {
        let dead = self.dead_letter_stream();
        let _: String = self.con.xadd(&dead, "*", entry).await?;
        self.acknowledge(id).await
    }
}

#[async_trait]
impl TaskSource for RedisStreamSource {
    async fn dequeue(&mut self, batch_size: usize, block: Duration) -> Result<Vec<Task>, QueueError> {
        let count = batch_size.max(1);
        for step in self.schedule.plan(Instant::now()) {
            let batch = match step {
                ReadStep::OwnPending => self.read("0", count, None).await?,
                ReadStep::ClaimIdle => self.claim_idle(count).await?,
                ReadStep::New => return self.read(">", count, Some(block)).await,
            };
            if !batch.is_empty() {
                tracing::debug!(count = batch.len(), ?step, consumer = %self.consumer, "redelivering pending entries");
                return Ok(batch);
            }
        }
        Ok(Vec::new())
    }

    async fn acknowledge(&mut self, id: &TaskId) -> Result<(), QueueError> {
        let _: usize = self
            .con
            .xack(&self.stream, &self.group, &[id.as_str()])
            .await?;
        Ok(())
    }

    async fn dead_letter(&mut self, task: &Task, reason: &str) -> Result<(), QueueError> {
        let fields = task.to_fields().into_iter().map(|(k, v)| (k.to_string(), v));
        let entry = dead_entry(fields, &task.id, reason);
        self.move_to_dead(&task.id, &entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn raw(id: &str, pairs: &[(&str, &str)]) -> RawEntry {
        RawEntry {
            id: id.to_string(),
            fields: pairs.iter().map(|(k, v)| (k.to_string(), bulk(v))).collect(),
        }
    }

    #[test]
    fn test_string_fields_skips_non_strings() {
        let mut map = HashMap::new();
        map.insert("file_path".to_string(), bulk("/data/a"));
        map.insert("port".to_string(), bulk("9001"));
        map.insert("weird".to_string(), Value::Nil);
        let raw = string_fields(&map);
        assert_eq!(raw.get("file_path").map(String::as_str), Some("/data/a"));
        assert_eq!(raw.get("port").map(String::as_str), Some("9001"));
        assert!(!raw.contains_key("weird"));
        let task = Task::from_fields(TaskId::new("1700000000000-0"), &raw).unwrap();
        assert_eq!(task.target_port, 9001);
        assert_eq!(task.target_host, "127.0.0.1");
    }

    #[test]
    fn test_decode_ready_entry() {
        match decode_entry(raw("5-0", &[("file_path", "/d/x"), ("target_ip", "10.0.0.2")])) {
            Decoded::Ready(t) => {
                assert_eq!(t.id.as_str(), "5-0");
                assert_eq!(t.target_host, "10.0.0.2");
                assert_eq!(t.target_port, 9000);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_trimmed_entry_is_acknowledged_not_delivered() {
        assert_eq!(
            decode_entry(raw("6-0", &[])),
            Decoded::Trimmed(TaskId::new("6-0"))
        );
    }

    #[test]
    fn test_malformed_entry_dead_letter_body() {
        let Decoded::Malformed { id, dead } = decode_entry(raw("7-0", &[("port", "70000"), ("file_path", "/a")])) else {
            panic!("expected a malformed entry");
        };
        assert_eq!(id.as_str(), "7-0");
        assert_eq!(dead[0], ("file_path".to_string(), "/a".to_string()));
        assert_eq!(dead[1], ("port".to_string(), "70000".to_string()));
        assert_eq!(dead[2].0, "reason");
        assert!(dead[2].1.contains("invalid port"), "{}", dead[2].1);
        assert_eq!(dead[3], ("source_id".to_string(), "7-0".to_string()));
    }

    #[test]
    fn test_dead_entry_for_failed_task() {
        let task = Task::from_fields(
            TaskId::new("8-0"),
            &[("file_path".to_string(), "/b".to_string())].into_iter().collect(),
        )
        .unwrap();
        let fields = task.to_fields().into_iter().map(|(k, v)| (k.to_string(), v));
        let dead = dead_entry(fields, &task.id, "5 failed attempts");
        let keys: Vec<&str> = dead.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["file_path", "port", "target_ip", "reason", "source_id"]);
        assert_eq!(dead[3].1, "5 failed attempts");
    }

    #[test]
    fn test_parse_autoclaim_reply() {
        let reply = Value::Array(vec![
            bulk("1700-3"),
            Value::Array(vec![
                Value::Array(vec![
                    bulk("1700-1"),
                    Value::Array(vec![bulk("file_path"), bulk("/c"), bulk("port"), bulk("9100")]),
                ]),
                Value::Array(vec![bulk("1700-2"), Value::Nil]),
                Value::Nil,
            ]),
            Value::Array(vec![bulk("1600-0")]),
        ]);
        let (cursor, entries) = parse_autoclaim(reply).unwrap();
        assert_eq!(cursor, "1700-3");
        assert_eq!(entries.len(), 2);
        match decode_entry(entries.into_iter().next().unwrap()) {
            Decoded::Ready(t) => assert_eq!(t.target_port, 9100),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_parse_autoclaim_trimmed_and_errors() {
        let reply = Value::Array(vec![
            bulk(CLAIM_START),
            Value::Array(vec![Value::Array(vec![bulk("9-0"), Value::Nil])]),
        ]);
        let (cursor, mut entries) = parse_autoclaim(reply).unwrap();
        assert_eq!(cursor, CLAIM_START);
        assert_eq!(decode_entry(entries.remove(0)), Decoded::Trimmed(TaskId::new("9-0")));

        assert!(matches!(parse_autoclaim(Value::Nil), Err(QueueError::Reply(_))));
        assert!(matches!(
            parse_autoclaim(Value::Array(vec![bulk("0-0")])),
            Err(QueueError::Reply(_))
        ));
    }

    #[test]
    fn test_reclaim_schedule() {
        let every = Duration::from_secs(30);
        let mut s = ReclaimSchedule::new(every, true);
        let t0 = Instant::now();
        assert_eq!(
            s.plan(t0),
            [ReadStep::OwnPending, ReadStep::ClaimIdle, ReadStep::New]
        );
        assert_eq!(s.plan(t0 + Duration::from_secs(1)), [ReadStep::New]);
        assert_eq!(s.plan(t0 + Duration::from_secs(29)), [ReadStep::New]);
        assert_eq!(s.plan(t0 + every)[0], ReadStep::OwnPending);
        assert_eq!(s.plan(t0 + every), [ReadStep::New]);
    }

    #[test]
    fn test_reclaim_schedule_without_claims() {
        let mut s = ReclaimSchedule::new(Duration::from_secs(30), false);
        assert_eq!(s.plan(Instant::now()), [ReadStep::OwnPending, ReadStep::New]);
    }

    /// Needs a live server: `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_restarted_consumer_claims_abandoned_entries() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let stream = format!(
            "filejet_test_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        );
        let settings = |consumer: &str| QueueSettings {
            redis_url: url.clone(),
            stream: stream.clone(),
            consumer: Some(consumer.to_string()),
            claim_min_idle_secs: 1,
            ..QueueSettings::default()
        };

        let mut first = RedisStreamSource::connect(&settings("engine-a")).await.unwrap();
        let id = first
            .enqueue(&[("file_path", "/tmp/x".to_string())])
            .await
            .unwrap();
        first.enqueue(&[("port", "1".to_string())]).await.unwrap();
        let got = first.dequeue(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, id);
        // engine-a goes away without acknowledging

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let mut second = RedisStreamSource::connect(&settings("engine-b")).await.unwrap();
        let again = second.dequeue(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, id);
        second.acknowledge(&id).await.unwrap();

        let dead_key = second.dead_letter_stream();
        let dead: redis::streams::StreamRangeReply = second.con.xrange_all(&dead_key).await.unwrap();
        assert_eq!(dead.ids.len(), 1);
        assert!(dead.ids[0].map.contains_key("reason"));
        assert!(dead.ids[0].map.contains_key("source_id"));

        let _: () = redis::cmd("DEL")
            .arg(&stream)
            .arg(&dead_key)
            .query_async(&mut second.con)
            .await
            .unwrap();
    }
}
