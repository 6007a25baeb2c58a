//! In-memory store implementation.
//!
//! One mutex guards the whole state, so every trait method is a single critical
//! section and `claim_next` is trivially atomic across workers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{HealthAlert, StoreError, TaskId, TaskRecord, TaskStatus};
use crate::ports::{InsertOutcome, QueueStore, ReplaceOutcome};

/// Ready-list entry: higher priority first, FIFO (lower seq) within a priority.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    task_id: TaskId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Delayed entry for retry backoff.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedEntry {
    available_at: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .available_at
            .cmp(&self.available_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Lane {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    paused: bool,
}

#[derive(Default)]
struct InMemoryStoreState {
    /// All task records (single source of truth).
    records: HashMap<TaskId, TaskRecord>,

    /// subject -> latest task id.
    subjects: HashMap<String, TaskId>,

    /// Per-queue ready/delayed heaps. They hold ids only.
    lanes: HashMap<String, Lane>,

    /// Current heap slot of each placed task. Heap entries whose seq no longer
    /// matches are stale and skipped lazily.
    slots: HashMap<TaskId, u64>,

    alerts: HashMap<String, HealthAlert>,

    next_seq: u64,
}

impl InMemoryStoreState {
    fn allocate_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn is_current(&self, task_id: &TaskId, seq: u64) -> bool {
        self.slots.get(task_id) == Some(&seq)
    }

    /// Live task other than `record` that the subject index points at.
    fn live_holder(&self, record: &TaskRecord) -> Option<TaskId> {
        let holder = self.subjects.get(&record.subject)?;
        if *holder == record.id {
            return None;
        }
        self.records
            .get(holder)
            .filter(|h| h.status.is_live())
            .map(|h| h.id.clone())
    }

    /// Put a pending record on its lane, or take it off when not pending.
    fn place(&mut self, record: &TaskRecord) {
        if record.status != TaskStatus::Pending {
            self.slots.remove(&record.id);
            return;
        }
        let seq = self.allocate_seq();
        self.slots.insert(record.id.clone(), seq);
        let lane = self.lanes.entry(record.queue.clone()).or_default();
        match record.available_at {
            Some(available_at) => lane.delayed.push(DelayedEntry {
                available_at,
                seq,
                task_id: record.id.clone(),
            }),
            None => lane.ready.push(ReadyEntry {
                priority: record.priority,
                seq,
                task_id: record.id.clone(),
            }),
        }
    }

    /// Move due delayed tasks of `queue` to its ready heap.
    fn promote_delayed(&mut self, queue: &str, now: DateTime<Utc>) {
        let mut due = Vec::new();
        if let Some(lane) = self.lanes.get_mut(queue) {
            while let Some(entry) = lane.delayed.peek() {
                if entry.available_at > now {
                    break;
                }
                if let Some(entry) = lane.delayed.pop() {
                    due.push(entry);
                }
            }
        }
        for entry in due {
            if !self.is_current(&entry.task_id, entry.seq) {
                continue;
            }
            let Some(priority) = self.records.get(&entry.task_id).map(|r| r.priority) else {
                continue;
            };
            let seq = self.allocate_seq();
            self.slots.insert(entry.task_id.clone(), seq);
            if let Some(lane) = self.lanes.get_mut(queue) {
                lane.ready.push(ReadyEntry {
                    priority,
                    seq,
                    task_id: entry.task_id,
                });
            }
        }
    }
}

/// In-memory `QueueStore`.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryStoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn insert(&self, record: &TaskRecord) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;

        if state.records.contains_key(&record.id) {
            return Ok(InsertOutcome::Duplicate(record.id.clone()));
        }
        if let Some(existing) = state.subjects.get(&record.subject)
            && let Some(holder) = state.records.get(existing)
            && holder.status.is_live()
        {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }

        state
            .subjects
            .insert(record.subject.clone(), record.id.clone());
        state.records.insert(record.id.clone(), record.clone());
        state.lanes.entry(record.queue.clone()).or_default();
        state.place(record);
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(id).cloned())
    }

    async fn find_by_subject(&self, subject: &str) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .subjects
            .get(subject)
            .and_then(|id| state.records.get(id))
            .cloned())
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut state = self.state.lock().await;
        if state.lanes.get(queue).is_none_or(|lane| lane.paused) {
            return Ok(None);
        }
        state.promote_delayed(queue, now);

        loop {
            let Some(entry) = state.lanes.get_mut(queue).and_then(|lane| lane.ready.pop()) else {
                return Ok(None);
            };
            if !state.is_current(&entry.task_id, entry.seq) {
                continue;
            }
            state.slots.remove(&entry.task_id);
            let Some(record) = state.records.get_mut(&entry.task_id) else {
                continue;
            };
            if record.start(worker_id, now).is_err() {
                continue;
            }
            record.version += 1;
            return Ok(Some(record.clone()));
        }
    }

    async fn replace(
        &self,
        record: &TaskRecord,
        expected: TaskStatus,
    ) -> Result<ReplaceOutcome, StoreError> {
        let mut state = self.state.lock().await;
        match state.records.get(&record.id) {
            Some(current) if current.status == expected && current.version == record.version => {}
            _ => return Ok(ReplaceOutcome::Stale),
        }
        if record.status.is_live()
            && let Some(holder) = state.live_holder(record)
        {
            return Ok(ReplaceOutcome::SubjectHeld(holder));
        }

        let mut stored = record.clone();
        stored.version += 1;
        if stored.status.is_live() {
            state
                .subjects
                .insert(stored.subject.clone(), stored.id.clone());
        }
        state.place(&stored);
        state.records.insert(stored.id.clone(), stored);
        Ok(ReplaceOutcome::Replaced)
    }

    async fn remove(&self, record: &TaskRecord) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let id = &record.id;
        if state
            .records
            .get(id)
            .is_none_or(|r| r.status != record.status || r.version != record.version)
        {
            return Ok(false);
        }
        state.records.remove(id);
        state.slots.remove(id);
        if state.subjects.get(&record.subject) == Some(id) {
            state.subjects.remove(&record.subject);
        }
        Ok(true)
    }

    async fn list(&self, queue: Option<&str>) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<TaskRecord> = state
            .records
            .values()
            .filter(|r| queue.is_none_or(|q| r.queue == q))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn queues(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.lanes.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.lanes.entry(queue.to_string()).or_default().paused = paused;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.lanes.get(queue).is_some_and(|lane| lane.paused))
    }

    async fn put_alert(&self, alert: &HealthAlert) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.alerts.insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    async fn get_alert(&self, id: &str) -> Result<Option<HealthAlert>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.alerts.get(id).cloned())
    }

    async fn list_alerts(&self) -> Result<Vec<HealthAlert>, StoreError> {
        let state = self.state.lock().await;
        let mut alerts: Vec<HealthAlert> = state.alerts.values().cloned().collect();
        alerts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(alerts)
    }
}
