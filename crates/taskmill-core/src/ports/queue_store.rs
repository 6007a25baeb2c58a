//! QueueStore port - the shared broker behind the engine.
//!
//! Implementations: `impls::InMemoryStore` (tests, embedded use) and
//! `impls::RedisStore` (production).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{HealthAlert, StoreError, TaskId, TaskRecord, TaskStatus};

/// Result of `QueueStore::insert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,

    /// A live task already holds the subject, or the id is taken.
    Duplicate(TaskId),
}

/// Result of `QueueStore::replace`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced,

    /// The record is gone, or its status or version moved since it was read.
    Stale,

    /// Writing the record live would give its subject a second live task.
    SubjectHeld(TaskId),
}

/// Durable task storage with lease semantics.
///
/// # Contract
/// - `insert` is atomic: duplicate check, subject index and ready-list append
///   happen together.
/// - `claim_next` is the only cross-worker atomic point. It promotes due
///   delayed tasks, honours the pause flag, and hands each pending task to
///   exactly one caller.
/// - `claim_next` stamps the lease (status, worker, start time, version) in the
///   same atomic step that pops the task.
/// - `replace` is a compare-and-swap on the stored status and version, and
///   bumps the version. A record written live is refused while another live
///   task holds its subject. Pending records are (re)placed on the ready list,
///   or the delayed set when `available_at` is set; records in any other
///   status are taken off both.
/// - Nothing here deletes tasks except `remove`, which only the monitor's
///   cleanup calls.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert(&self, record: &TaskRecord) -> Result<InsertOutcome, StoreError>;

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Latest task indexed under `subject`, live or not.
    async fn find_by_subject(&self, subject: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// Lease the highest-priority eligible task of `queue`.
    ///
    /// Returns `None` when the queue is empty or paused.
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// Write `record` if the stored status still equals `expected` and the
    /// stored version equals `record.version`. The stored copy gets
    /// `record.version + 1`.
    async fn replace(
        &self,
        record: &TaskRecord,
        expected: TaskStatus,
    ) -> Result<ReplaceOutcome, StoreError>;

    /// Delete the record if its stored status and version still match
    /// `record`.
    async fn remove(&self, record: &TaskRecord) -> Result<bool, StoreError>;

    /// All tasks, or the tasks of one queue.
    async fn list(&self, queue: Option<&str>) -> Result<Vec<TaskRecord>, StoreError>;

    /// Names of every queue that ever received a task.
    async fn queues(&self) -> Result<Vec<String>, StoreError>;

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), StoreError>;

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError>;

    async fn put_alert(&self, alert: &HealthAlert) -> Result<(), StoreError>;

    async fn get_alert(&self, id: &str) -> Result<Option<HealthAlert>, StoreError>;

    async fn list_alerts(&self) -> Result<Vec<HealthAlert>, StoreError>;
}
