//! Redis-backed store.
//!
//! # Key layout
//!
//! - `{prefix}:task:{id}`: hash `{status, version, queue, subject, priority, slot, data, worker_id, started_at}`
//! - `{prefix}:subject:{subject}`: id of the latest task for the subject
//! - `{prefix}:queue:{queue}:ready`: sorted set, score `-priority`, member `{seq:016}:{id}`
//! - `{prefix}:queue:{queue}:delayed`: sorted set, score = eligible time in ms
//! - `{prefix}:queue:{queue}:tasks`: set of ids
//! - `{prefix}:queue:{queue}:paused`: flag
//! - `{prefix}:queues`, `{prefix}:alerts`, `{prefix}:seq`
//!
//! Equal scores in a sorted set are ordered by member, so the zero-padded
//! sequence keeps FIFO within a priority level. The `status` and `version`
//! hash fields are authoritative. A claim stamps `worker_id` and `started_at`
//! next to the untouched `data`; readers overlay them until the next replace
//! rewrites `data` and drops the stamp.
//!
//! Insert, claim, replace and remove each run as one Lua script, which gives
//! the atomicity the `QueueStore` contract asks for.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::domain::{HealthAlert, StoreError, TaskId, TaskRecord, TaskStatus};
use crate::ports::{InsertOutcome, QueueStore, ReplaceOutcome};

const INSERT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return ARGV[1] end
local existing = redis.call('GET', KEYS[2])
if existing then
  local st = redis.call('HGET', ARGV[6] .. ':task:' .. existing, 'status')
  if st == 'pending' or st == 'processing' then return existing end
end
local seq = redis.call('INCR', KEYS[6])
local slot = string.format('%016d', seq) .. ':' .. ARGV[1]
redis.call('HSET', KEYS[1], 'status', 'pending', 'version', 0, 'queue', ARGV[3], 'subject', ARGV[2],
  'priority', ARGV[4], 'slot', slot, 'data', ARGV[5])
redis.call('SET', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('SADD', KEYS[4], ARGV[3])
redis.call('ZADD', KEYS[5], -tonumber(ARGV[4]), slot)
return false
"#;

const CLAIM_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 1 then return false end
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local tkey = ARGV[2] .. ':task:' .. id
  if redis.call('HGET', tkey, 'status') == 'pending' then
    local seq = redis.call('INCR', KEYS[4])
    local slot = string.format('%016d', seq) .. ':' .. id
    local priority = tonumber(redis.call('HGET', tkey, 'priority')) or 0
    redis.call('HSET', tkey, 'slot', slot)
    redis.call('ZADD', KEYS[1], -priority, slot)
  end
end
while true do
  local popped = redis.call('ZPOPMIN', KEYS[1])
  if #popped == 0 then return false end
  local slot = popped[1]
  local id = string.sub(slot, 18)
  local tkey = ARGV[2] .. ':task:' .. id
  if redis.call('HGET', tkey, 'status') == 'pending' and redis.call('HGET', tkey, 'slot') == slot then
    redis.call('HSET', tkey, 'status', 'processing', 'slot', '', 'worker_id', ARGV[3], 'started_at', ARGV[4])
    local version = redis.call('HINCRBY', tkey, 'version', 1)
    return {redis.call('HGET', tkey, 'data'), version}
  end
end
"#;

const REPLACE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= ARGV[1] then return {'stale'} end
if (redis.call('HGET', KEYS[1], 'version') or '0') ~= ARGV[7] then return {'stale'} end
local live = ARGV[2] == 'pending' or ARGV[2] == 'processing'
if live then
  local holder = redis.call('GET', KEYS[5])
  if holder and holder ~= ARGV[6] then
    local st = redis.call('HGET', ARGV[8] .. ':task:' .. holder, 'status')
    if st == 'pending' or st == 'processing' then return {'held', holder} end
  end
end
local old = redis.call('HGET', KEYS[1], 'slot')
if old and old ~= '' then redis.call('ZREM', KEYS[2], old) end
redis.call('ZREM', KEYS[3], ARGV[6])
local slot = ''
if ARGV[2] == 'pending' then
  if ARGV[5] ~= '' then
    redis.call('ZADD', KEYS[3], tonumber(ARGV[5]), ARGV[6])
  else
    local seq = redis.call('INCR', KEYS[4])
    slot = string.format('%016d', seq) .. ':' .. ARGV[6]
    redis.call('ZADD', KEYS[2], -tonumber(ARGV[4]), slot)
  end
end
if live then redis.call('SET', KEYS[5], ARGV[6]) end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'priority', ARGV[4], 'slot', slot, 'data', ARGV[3])
redis.call('HINCRBY', KEYS[1], 'version', 1)
redis.call('HDEL', KEYS[1], 'worker_id', 'started_at')
return {'ok'}
"#;

const REMOVE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= ARGV[3] then return 0 end
if (redis.call('HGET', KEYS[1], 'version') or '0') ~= ARGV[4] then return 0 end
local slot = redis.call('HGET', KEYS[1], 'slot')
if slot and slot ~= '' then redis.call('ZREM', KEYS[2], slot) end
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('SREM', KEYS[4], ARGV[1])
local subject = redis.call('HGET', KEYS[1], 'subject')
if subject then
  local skey = ARGV[2] .. ':subject:' .. subject
  if redis.call('GET', skey) == ARGV[1] then redis.call('DEL', skey) end
end
redis.call('DEL', KEYS[1])
return 1
"#;

/// Hash fields read back for one task, in `TaskRow` order.
const TASK_FIELDS: [&str; 5] = ["status", "data", "version", "worker_id", "started_at"];

type TaskRow = (
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn lease_stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Key builder for one prefix.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn task(&self, id: &TaskId) -> String {
        format!("{}:task:{}", self.prefix, id)
    }

    pub fn subject(&self, subject: &str) -> String {
        format!("{}:subject:{}", self.prefix, subject)
    }

    pub fn ready(&self, queue: &str) -> String {
        format!("{}:queue:{}:ready", self.prefix, queue)
    }

    pub fn delayed(&self, queue: &str) -> String {
        format!("{}:queue:{}:delayed", self.prefix, queue)
    }

    pub fn queue_tasks(&self, queue: &str) -> String {
        format!("{}:queue:{}:tasks", self.prefix, queue)
    }

    pub fn paused(&self, queue: &str) -> String {
        format!("{}:queue:{}:paused", self.prefix, queue)
    }

    pub fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    pub fn alerts(&self) -> String {
        format!("{}:alerts", self.prefix)
    }

    pub fn seq(&self) -> String {
        format!("{}:seq", self.prefix)
    }
}

/// Redis `QueueStore`.
///
/// The connection manager reconnects on its own; every call clones it.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    keys: RedisKeys,
    insert_script: Script,
    claim_script: Script,
    replace_script: Script,
    remove_script: Script,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - e.g. `redis://localhost:6379`
    /// * `prefix` - namespace for every key this store touches
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(redis, prefix))
    }

    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            keys: RedisKeys::new(prefix),
            insert_script: Script::new(INSERT_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            replace_script: Script::new(REPLACE_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
        }
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    fn task_row_cmd(&self, id: &TaskId) -> redis::Cmd {
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(self.keys.task(id));
        for field in TASK_FIELDS {
            cmd.arg(field);
        }
        cmd
    }

    fn decode(row: TaskRow) -> Result<Option<TaskRecord>, StoreError> {
        let (status, data, version, worker_id, started_at) = row;
        let Some(data) = data else {
            return Ok(None);
        };
        let mut record: TaskRecord = serde_json::from_str(&data)?;
        if record.status == TaskStatus::Pending
            && let (Some(worker_id), Some(started_at)) = (worker_id, started_at)
        {
            let started_at = DateTime::parse_from_rfc3339(&started_at)
                .map_err(|e| StoreError::Corrupt(format!("task {} started_at: {e}", record.id)))?
                .with_timezone(&Utc);
            record
                .start(&worker_id, started_at)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        }
        if let Some(status) = status {
            record.status = status.parse().map_err(StoreError::Corrupt)?;
        }
        if let Some(version) = version {
            record.version = version
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("task {} version: {e}", record.id)))?;
        }
        Ok(Some(record))
    }

    async fn load_many(&self, ids: Vec<String>) -> Result<Vec<TaskRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.add_command(self.task_row_cmd(&TaskId::new(id.as_str())));
        }
        let rows: Vec<TaskRow> = pipe.query_async(&mut conn).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(record) = Self::decode(row)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn insert(&self, record: &TaskRecord) -> Result<InsertOutcome, StoreError> {
        let data = serde_json::to_string(record)?;
        let mut conn = self.redis.clone();
        let duplicate: Option<String> = self
            .insert_script
            .key(self.keys.task(&record.id))
            .key(self.keys.subject(&record.subject))
            .key(self.keys.queue_tasks(&record.queue))
            .key(self.keys.queues())
            .key(self.keys.ready(&record.queue))
            .key(self.keys.seq())
            .arg(record.id.as_str())
            .arg(&record.subject)
            .arg(&record.queue)
            .arg(record.priority)
            .arg(data)
            .arg(self.keys.prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(match duplicate {
            Some(existing) => InsertOutcome::Duplicate(TaskId::new(existing)),
            None => InsertOutcome::Inserted,
        })
    }

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let row: TaskRow = self.task_row_cmd(id).query_async(&mut conn).await?;
        Self::decode(row)
    }

    async fn find_by_subject(&self, subject: &str) -> Result<Option<TaskRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let id: Option<String> = conn.get(self.keys.subject(subject)).await?;
        match id {
            Some(id) => self.get(&TaskId::new(id)).await,
            None => Ok(None),
        }
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let claimed: Option<(String, u64)> = self
            .claim_script
            .key(self.keys.ready(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.paused(queue))
            .key(self.keys.seq())
            .arg(now.timestamp_millis())
            .arg(self.keys.prefix())
            .arg(worker_id)
            .arg(lease_stamp(now))
            .invoke_async(&mut conn)
            .await?;
        let Some((data, version)) = claimed else {
            return Ok(None);
        };

        let mut record: TaskRecord = serde_json::from_str(&data)?;
        record
            .start(worker_id, now)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        record.version = version;
        Ok(Some(record))
    }

    async fn replace(
        &self,
        record: &TaskRecord,
        expected: TaskStatus,
    ) -> Result<ReplaceOutcome, StoreError> {
        let data = serde_json::to_string(record)?;
        let available_at = record
            .available_at
            .map(|at| at.timestamp_millis().to_string())
            .unwrap_or_default();
        let mut conn = self.redis.clone();
        let reply: Vec<String> = self
            .replace_script
            .key(self.keys.task(&record.id))
            .key(self.keys.ready(&record.queue))
            .key(self.keys.delayed(&record.queue))
            .key(self.keys.seq())
            .key(self.keys.subject(&record.subject))
            .arg(expected.as_str())
            .arg(record.status.as_str())
            .arg(data)
            .arg(record.priority)
            .arg(available_at)
            .arg(record.id.as_str())
            .arg(record.version)
            .arg(self.keys.prefix())
            .invoke_async(&mut conn)
            .await?;
        match reply.as_slice() {
            [tag] if tag == "ok" => Ok(ReplaceOutcome::Replaced),
            [tag] if tag == "stale" => Ok(ReplaceOutcome::Stale),
            [tag, holder] if tag == "held" => {
                Ok(ReplaceOutcome::SubjectHeld(TaskId::new(holder.as_str())))
            }
            other => Err(StoreError::Corrupt(format!("unexpected replace reply {other:?}"))),
        }
    }

    async fn remove(&self, record: &TaskRecord) -> Result<bool, StoreError> {
        let id = &record.id;
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .remove_script
            .key(self.keys.task(id))
            .key(self.keys.ready(&record.queue))
            .key(self.keys.delayed(&record.queue))
            .key(self.keys.queue_tasks(&record.queue))
            .arg(id.as_str())
            .arg(self.keys.prefix())
            .arg(record.status.as_str())
            .arg(record.version)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn list(&self, queue: Option<&str>) -> Result<Vec<TaskRecord>, StoreError> {
        let queues = match queue {
            Some(queue) => vec![queue.to_string()],
            None => self.queues().await?,
        };
        let mut conn = self.redis.clone();
        let mut ids = Vec::new();
        for queue in &queues {
            let members: Vec<String> = conn.smembers(self.keys.queue_tasks(queue)).await?;
            ids.extend(members);
        }
        let mut records = self.load_many(ids).await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn queues(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let mut names: Vec<String> = conn.smembers(self.keys.queues()).await?;
        names.sort();
        Ok(names)
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: () = conn.sadd(self.keys.queues(), queue).await?;
        if paused {
            let _: () = conn.set(self.keys.paused(queue), "1").await?;
        } else {
            let _: () = conn.del(self.keys.paused(queue)).await?;
        }
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let paused: bool = conn.exists(self.keys.paused(queue)).await?;
        Ok(paused)
    }

    async fn put_alert(&self, alert: &HealthAlert) -> Result<(), StoreError> {
        let data = serde_json::to_string(alert)?;
        let mut conn = self.redis.clone();
        let _: () = conn.hset(self.keys.alerts(), &alert.id, data).await?;
        Ok(())
    }

    async fn get_alert(&self, id: &str) -> Result<Option<HealthAlert>, StoreError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.hget(self.keys.alerts(), id).await?;
        data.map(|d| serde_json::from_str(&d).map_err(StoreError::from))
            .transpose()
    }

    async fn list_alerts(&self) -> Result<Vec<HealthAlert>, StoreError> {
        let mut conn = self.redis.clone();
        let values: Vec<String> = conn.hvals(self.keys.alerts()).await?;
        let mut alerts = values
            .iter()
            .map(|v| serde_json::from_str::<HealthAlert>(v))
            .collect::<Result<Vec<_>, _>>()?;
        alerts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, TaskType};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn record(id: &str, subject: &str, priority: i32) -> TaskRecord {
        TaskRecord::new(
            TaskId::new(id),
            subject.to_string(),
            TaskType::new("notification"),
            "default".into(),
            serde_json::json!({ "id": id }),
            priority,
            3,
            t0(),
        )
    }

    #[test]
    fn keys_are_namespaced_by_prefix() {
        let keys = RedisKeys::new("tm");
        assert_eq!(keys.task(&TaskId::new("t1")), "tm:task:t1");
        assert_eq!(keys.subject("alert-42"), "tm:subject:alert-42");
        assert_eq!(keys.ready("default"), "tm:queue:default:ready");
        assert_eq!(keys.delayed("default"), "tm:queue:default:delayed");
        assert_eq!(keys.paused("default"), "tm:queue:default:paused");
    }

    #[test]
    fn ready_slot_offset_matches_script() {
        // CLAIM_SCRIPT reads the id from position 18 (1-based) of the slot.
        let slot = format!("{:016}:{}", 42, "t1");
        assert_eq!(&slot[17..], "t1");
        assert!(CLAIM_SCRIPT.contains("string.sub(slot, 18)"));
    }

    #[test]
    fn hash_fields_override_stale_data() {
        let data = serde_json::to_string(&record("t1", "s", 0)).unwrap();
        let decoded = RedisStore::decode((
            Some("completed".into()),
            Some(data),
            Some("4".into()),
            None,
            None,
        ))
        .unwrap()
        .unwrap();
        assert_eq!(decoded.status, TaskStatus::Completed);
        assert_eq!(decoded.version, 4);
        assert!(RedisStore::decode((None, None, None, None, None)).unwrap().is_none());
    }

    #[test]
    fn claim_stamp_overlays_pending_data() {
        let mut stale = record("t1", "s", 0);
        stale.error_message = Some("boom".into());
        let data = serde_json::to_string(&stale).unwrap();
        let started = t0() + Duration::milliseconds(1_250);

        let decoded = RedisStore::decode((
            Some("processing".into()),
            Some(data.clone()),
            Some("1".into()),
            Some("w7".into()),
            Some(lease_stamp(started)),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(decoded.status, TaskStatus::Processing);
        assert_eq!(decoded.worker_id.as_deref(), Some("w7"));
        assert_eq!(decoded.started_at, Some(started));
        assert_eq!(decoded.error_message, None);
        assert_eq!(decoded.version, 1);

        let garbled = RedisStore::decode((
            Some("processing".into()),
            Some(data),
            Some("1".into()),
            Some("w7".into()),
            Some("yesterday".into()),
        ));
        assert!(matches!(garbled, Err(StoreError::Corrupt(_))));
    }

    fn redis_url() -> String {
        std::env::var("TASKMILL_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
    }

    async fn live_store() -> RedisStore {
        let prefix = format!("taskmill-test-{}", ulid::Ulid::new());
        RedisStore::connect(&redis_url(), &prefix).await.unwrap()
    }

    #[tokio::test]
    #[ignore] // needs a running Redis (TASKMILL_REDIS_URL)
    async fn redis_store_claims_each_task_once() {
        let store = live_store().await;
        for i in 0..5 {
            let record = record(&format!("t{i}"), &format!("s{i}"), i);
            assert_eq!(store.insert(&record).await.unwrap(), InsertOutcome::Inserted);
        }

        let mut handles = Vec::new();
        for w in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(r) = store
                    .claim_next("default", &format!("w{w}"), Utc::now())
                    .await
                    .unwrap()
                {
                    got.push(r.id.to_string());
                }
                got
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        assert_eq!(all, vec!["t0", "t1", "t2", "t3", "t4"]);

        for record in store.list(None).await.unwrap() {
            assert_eq!(record.status, TaskStatus::Processing);
            assert!(record.worker_id.is_some());
            assert!(store.remove(&record).await.unwrap());
        }
    }

    #[tokio::test]
    #[ignore] // needs a running Redis (TASKMILL_REDIS_URL)
    async fn redis_claim_serves_priority_then_fifo() {
        let store = live_store().await;
        store.insert(&record("low", "a", 0)).await.unwrap();
        store.insert(&record("high-1", "b", 5)).await.unwrap();
        store.insert(&record("high-2", "c", 5)).await.unwrap();

        let mut order = Vec::new();
        while let Some(r) = store.claim_next("default", "w", t0()).await.unwrap() {
            order.push(r.id.to_string());
        }
        assert_eq!(order, vec!["high-1", "high-2", "low"]);
    }

    #[tokio::test]
    #[ignore] // needs a running Redis (TASKMILL_REDIS_URL)
    async fn redis_claim_is_visible_to_readers() {
        let store = live_store().await;
        store.insert(&record("t1", "s", 0)).await.unwrap();
        let leased = store.claim_next("default", "w1", t0()).await.unwrap().unwrap();

        let read = store.get(&TaskId::new("t1")).await.unwrap().unwrap();
        assert_eq!(read.status, TaskStatus::Processing);
        assert_eq!(read.worker_id.as_deref(), Some("w1"));
        assert_eq!(read.started_at, Some(t0()));
        assert_eq!(read.version, leased.version);
        assert_eq!(store.list(None).await.unwrap(), vec![read]);
    }

    #[tokio::test]
    #[ignore] // needs a running Redis (TASKMILL_REDIS_URL)
    async fn redis_delayed_task_is_promoted_when_due() {
        let store = live_store().await;
        store.insert(&record("t1", "s", 0)).await.unwrap();
        let mut leased = store.claim_next("default", "w", t0()).await.unwrap().unwrap();
        leased
            .requeue("boom".into(), Some(t0() + Duration::seconds(10)), t0())
            .unwrap();
        assert_eq!(
            store.replace(&leased, TaskStatus::Processing).await.unwrap(),
            ReplaceOutcome::Replaced
        );

        assert!(store.claim_next("default", "w", t0()).await.unwrap().is_none());
        let later = store
            .claim_next("default", "w", t0() + Duration::seconds(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(later.retry_count, 1);
        assert_eq!(later.error_message, None);
    }

    #[tokio::test]
    #[ignore] // needs a running Redis (TASKMILL_REDIS_URL)
    async fn redis_replace_checks_status_and_version() {
        let store = live_store().await;
        store.insert(&record("t1", "s", 0)).await.unwrap();
        let first_lease = store.claim_next("default", "w1", t0()).await.unwrap().unwrap();

        let mut completed = first_lease.clone();
        completed.complete(None, t0()).unwrap();
        assert_eq!(
            store.replace(&completed, TaskStatus::Pending).await.unwrap(),
            ReplaceOutcome::Stale
        );

        let mut requeued = first_lease.clone();
        requeued.requeue("lease expired".into(), None, t0()).unwrap();
        assert_eq!(
            store.replace(&requeued, TaskStatus::Processing).await.unwrap(),
            ReplaceOutcome::Replaced
        );
        store.claim_next("default", "w2", t0()).await.unwrap().unwrap();

        // same status as the first lease, older version
        assert_eq!(
            store.replace(&completed, TaskStatus::Processing).await.unwrap(),
            ReplaceOutcome::Stale
        );
        let stored = store.get(&TaskId::new("t1")).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
        assert_eq!(stored.worker_id.as_deref(), Some("w2"));
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    #[ignore] // needs a running Redis (TASKMILL_REDIS_URL)
    async fn redis_revive_is_refused_while_subject_is_held() {
        let store = live_store().await;
        store.insert(&record("t1", "alert-42", 0)).await.unwrap();
        let mut failed = store.claim_next("default", "w", t0()).await.unwrap().unwrap();
        failed.fail(FailureKind::Rejected, "x".into(), t0()).unwrap();
        assert_eq!(
            store.replace(&failed, TaskStatus::Processing).await.unwrap(),
            ReplaceOutcome::Replaced
        );
        store.insert(&record("t2", "alert-42", 0)).await.unwrap();

        let mut revived = store.get(&TaskId::new("t1")).await.unwrap().unwrap();
        revived.revive(t0()).unwrap();
        assert_eq!(
            store.replace(&revived, TaskStatus::Failed).await.unwrap(),
            ReplaceOutcome::SubjectHeld(TaskId::new("t2"))
        );
        let holder = store.find_by_subject("alert-42").await.unwrap().unwrap();
        assert_eq!(holder.id, TaskId::new("t2"));
    }

    #[tokio::test]
    #[ignore] // needs a running Redis (TASKMILL_REDIS_URL)
    async fn redis_remove_is_conditional_and_drops_subject() {
        let store = live_store().await;
        store.insert(&record("t1", "s", 0)).await.unwrap();
        let stored = store.get(&TaskId::new("t1")).await.unwrap().unwrap();

        let mut other_status = stored.clone();
        other_status.status = TaskStatus::Completed;
        assert!(!store.remove(&other_status).await.unwrap());
        let mut other_version = stored.clone();
        other_version.version += 1;
        assert!(!store.remove(&other_version).await.unwrap());

        assert!(store.remove(&stored).await.unwrap());
        assert!(store.find_by_subject("s").await.unwrap().is_none());
        assert!(store.claim_next("default", "w", t0()).await.unwrap().is_none());
        assert!(!store.remove(&stored).await.unwrap());
    }
}
