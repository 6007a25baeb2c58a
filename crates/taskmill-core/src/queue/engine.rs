//! TaskQueue - enqueue, lease/ack/nack, lookup and operator actions.
//!
//! The engine keeps no task state of its own. Every operation reads from the
//! store and writes back with a compare-and-swap on the status it read, so
//! racing workers and operators cannot both win.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{
    Decider, Decision, DefaultDecider, FailureKind, MAX_PRIORITY, NewTask, QueueError,
    QueueResult, TaskId, TaskRecord, TaskStatus,
};
use crate::ports::{Clock, IdGenerator, InsertOutcome, QueueStore, ReplaceOutcome, UlidGenerator};

use super::batch::BatchReport;
use super::retry::RetryPolicy;

/// Upper bound accepted for `max_retry`.
pub const MAX_RETRY_LIMIT: u32 = 100;

pub const DEFAULT_QUEUE: &str = "default";

const CANCEL_REASON: &str = "cancelled by user";
const SKIP_REASON: &str = "skipped by operator";

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Queue used when a submission names none.
    pub default_queue: String,

    /// `max_retry` used when a submission gives none.
    pub default_max_retry: u32,

    /// A processing task older than this is considered stalled.
    pub lease_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE.to_string(),
            default_max_retry: 3,
            lease_timeout: Duration::from_secs(300),
        }
    }
}

/// A task handed to one worker.
///
/// The worker must report back with `TaskQueue::ack` or `TaskQueue::nack`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub task_id: TaskId,
    pub worker_id: String,
    pub record: TaskRecord,
}

/// What a caller polling for a result sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskResult {
    /// Never submitted (or already cleaned up).
    NotFound,

    /// Pending or processing.
    InProgress { status: TaskStatus },

    Completed {
        result: Option<serde_json::Value>,
    },

    Failed { kind: FailureKind, reason: String },
}

/// The task queue engine.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
    config: EngineConfig,
}

#[derive(Debug, Clone, Copy)]
enum OperatorAction {
    Retry,
    Skip,
    Cancel,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn QueueStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            decider: Arc::new(DefaultDecider::default()),
            store,
            clock,
            config,
        }
    }

    pub fn with_retry_policy(self, policy: RetryPolicy) -> Self {
        self.with_decider(Arc::new(DefaultDecider::new(policy)))
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Submit a task.
    ///
    /// # Errors
    /// - `Validation` for a malformed submission (nothing is stored)
    /// - `AlreadyExists` when a live task holds the subject or the id is taken
    pub async fn push(&self, task: NewTask) -> QueueResult<TaskRecord> {
        self.validate(&task)?;

        let id = task.id.unwrap_or_else(|| self.ids.generate_task_id());
        let subject = task.subject.unwrap_or_else(|| id.to_string());
        let queue = task
            .queue
            .unwrap_or_else(|| self.config.default_queue.clone());
        let max_retry = task.max_retry.unwrap_or(self.config.default_max_retry);

        let record = TaskRecord::new(
            id,
            subject,
            task.task_type,
            queue,
            task.payload,
            task.priority,
            max_retry,
            self.clock.now(),
        );

        match self.store.insert(&record).await? {
            InsertOutcome::Inserted => {
                info!(
                    task_id = %record.id,
                    subject = %record.subject,
                    task_type = %record.task_type,
                    queue = %record.queue,
                    priority = record.priority,
                    "task enqueued"
                );
                Ok(record)
            }
            InsertOutcome::Duplicate(existing) => {
                debug!(subject = %record.subject, existing = %existing, "duplicate submission");
                Err(QueueError::AlreadyExists {
                    subject: record.subject,
                    existing,
                })
            }
        }
    }

    fn validate(&self, task: &NewTask) -> QueueResult<()> {
        if task.task_type.as_str().trim().is_empty() {
            return Err(QueueError::Validation("task_type is required".into()));
        }
        if let Some(id) = &task.id
            && !TaskId::is_valid(id.as_str())
        {
            return Err(QueueError::Validation(format!("invalid task id '{id}'")));
        }
        if let Some(subject) = &task.subject
            && !TaskId::is_valid(subject)
        {
            return Err(QueueError::Validation(format!("invalid subject '{subject}'")));
        }
        if let Some(queue) = &task.queue
            && !TaskId::is_valid(queue)
        {
            return Err(QueueError::Validation(format!("invalid queue name '{queue}'")));
        }
        if !(-MAX_PRIORITY..=MAX_PRIORITY).contains(&task.priority) {
            return Err(QueueError::Validation(format!(
                "priority {} outside -{MAX_PRIORITY}..={MAX_PRIORITY}",
                task.priority
            )));
        }
        if task.payload.is_null() {
            return Err(QueueError::Validation("payload is required".into()));
        }
        if let Some(max_retry) = task.max_retry
            && max_retry > MAX_RETRY_LIMIT
        {
            return Err(QueueError::Validation(format!(
                "max_retry {max_retry} exceeds {MAX_RETRY_LIMIT}"
            )));
        }
        Ok(())
    }

    /// Look up a task by id, falling back to the latest task for a subject.
    pub async fn get_task_status(&self, key: &str) -> QueueResult<Option<TaskRecord>> {
        if let Some(record) = self.store.get(&TaskId::new(key)).await? {
            return Ok(Some(record));
        }
        Ok(self.store.find_by_subject(key).await?)
    }

    /// Result view of `get_task_status`.
    pub async fn get_result(&self, key: &str) -> QueueResult<TaskResult> {
        let Some(record) = self.get_task_status(key).await? else {
            return Ok(TaskResult::NotFound);
        };
        Ok(match record.status {
            TaskStatus::Pending | TaskStatus::Processing => TaskResult::InProgress {
                status: record.status,
            },
            TaskStatus::Completed => TaskResult::Completed {
                result: record.result,
            },
            TaskStatus::Failed => TaskResult::Failed {
                kind: record.failure_kind.unwrap_or(FailureKind::Rejected),
                reason: record.error_message.unwrap_or_default(),
            },
        })
    }

    /// Lease the next eligible task of `queue`.
    ///
    /// Returns `None` when nothing is eligible or the queue is paused.
    pub async fn lease(&self, queue: &str, worker_id: &str) -> QueueResult<Option<Lease>> {
        if worker_id.trim().is_empty() {
            return Err(QueueError::Validation("worker_id is required".into()));
        }
        let Some(record) = self
            .store
            .claim_next(queue, worker_id, self.clock.now())
            .await?
        else {
            return Ok(None);
        };
        debug!(
            task_id = %record.id,
            queue,
            worker_id,
            attempt = record.retry_count + 1,
            "task leased"
        );
        Ok(Some(Lease {
            task_id: record.id.clone(),
            worker_id: worker_id.to_string(),
            record,
        }))
    }

    /// Load the record behind a lease and check the caller still holds it.
    async fn held(&self, lease: &Lease) -> QueueResult<TaskRecord> {
        let record = self
            .store
            .get(&lease.task_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(lease.task_id.clone()))?;
        if record.status != TaskStatus::Processing {
            return Err(QueueError::Conflict {
                id: record.id,
                expected: TaskStatus::Processing,
            });
        }
        if record.worker_id.as_deref() != Some(lease.worker_id.as_str()) {
            return Err(QueueError::LeaseMismatch {
                id: record.id,
                worker_id: lease.worker_id.clone(),
            });
        }
        Ok(record)
    }

    /// Conditional write of a record read earlier. On success `record`
    /// carries the version the store now holds.
    async fn write(&self, record: &mut TaskRecord, expected: TaskStatus) -> QueueResult<()> {
        match self.store.replace(record, expected).await? {
            ReplaceOutcome::Replaced => {
                record.version += 1;
                Ok(())
            }
            ReplaceOutcome::Stale => {
                warn!(task_id = %record.id, expected = %expected, "lost concurrent update");
                Err(QueueError::Conflict {
                    id: record.id.clone(),
                    expected,
                })
            }
            ReplaceOutcome::SubjectHeld(existing) => Err(QueueError::AlreadyExists {
                subject: record.subject.clone(),
                existing,
            }),
        }
    }

    /// Report success for a lease.
    pub async fn ack(
        &self,
        lease: &Lease,
        result: Option<serde_json::Value>,
    ) -> QueueResult<TaskRecord> {
        let mut record = self.held(lease).await?;
        record.complete(result, self.clock.now())?;
        self.write(&mut record, TaskStatus::Processing).await?;
        info!(
            task_id = %record.id,
            queue = %record.queue,
            worker_id = %lease.worker_id,
            duration_ms = record.duration().map(|d| d.num_milliseconds()),
            "task completed"
        );
        Ok(record)
    }

    /// Report failure for a lease.
    ///
    /// With `requeue` and retries left the task goes back to pending after the
    /// retry policy's delay; otherwise it becomes terminal `failed`. A nack on
    /// a task that is already `failed` returns it unchanged.
    pub async fn nack(&self, lease: &Lease, requeue: bool, error: &str) -> QueueResult<TaskRecord> {
        let current = self
            .store
            .get(&lease.task_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(lease.task_id.clone()))?;
        if current.status == TaskStatus::Failed {
            debug!(task_id = %current.id, "nack on failed task ignored");
            return Ok(current);
        }
        let record = self.held(lease).await?;
        let decision = self.decider.decide(&record, requeue, error);
        self.settle_failure(record, decision).await
    }

    /// Apply a decision to a processing record and persist it.
    async fn settle_failure(
        &self,
        mut record: TaskRecord,
        decision: Decision,
    ) -> QueueResult<TaskRecord> {
        let now = self.clock.now();
        match decision {
            Decision::Retry { delay, reason } => {
                let available_at = eligible_after(now, delay);
                record.requeue(reason, available_at, now)?;
                self.write(&mut record, TaskStatus::Processing).await?;
                info!(
                    task_id = %record.id,
                    retry_count = record.retry_count,
                    max_retry = record.max_retry,
                    delay_ms = delay.as_millis() as u64,
                    "task requeued"
                );
            }
            Decision::MarkFailed { kind, reason } => {
                record.fail(kind, reason, now)?;
                self.write(&mut record, TaskStatus::Processing).await?;
                warn!(
                    task_id = %record.id,
                    kind = %kind,
                    retry_count = record.retry_count,
                    error = record.error_message.as_deref().unwrap_or_default(),
                    "task failed"
                );
            }
        }
        Ok(record)
    }

    async fn load(&self, id: &TaskId) -> QueueResult<TaskRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    /// Cancel a pending or processing task. A running worker is not
    /// interrupted; its later ack gets `Conflict`.
    pub async fn cancel(&self, id: &TaskId, reason: Option<&str>) -> QueueResult<TaskRecord> {
        let mut record = self.load(id).await?;
        let expected = record.status;
        let reason = reason.unwrap_or(CANCEL_REASON).to_string();
        record.fail(FailureKind::Cancelled, reason, self.clock.now())?;
        self.write(&mut record, expected).await?;
        info!(task_id = %record.id, from = %expected, "task cancelled");
        Ok(record)
    }

    /// Skip a pending or processing task (terminal, never retried).
    pub async fn skip(&self, id: &TaskId) -> QueueResult<TaskRecord> {
        let mut record = self.load(id).await?;
        let expected = record.status;
        record.fail(FailureKind::Skipped, SKIP_REASON.to_string(), self.clock.now())?;
        self.write(&mut record, expected).await?;
        info!(task_id = %record.id, from = %expected, "task skipped");
        Ok(record)
    }

    /// Put a failed task back to pending with a fresh retry budget.
    ///
    /// Refused with `AlreadyExists` while another live task holds the subject.
    pub async fn retry(&self, id: &TaskId) -> QueueResult<TaskRecord> {
        let mut record = self.load(id).await?;
        if record.status != TaskStatus::Failed {
            return Err(QueueError::InvalidTransition {
                id: record.id,
                from: record.status,
                action: "retry",
            });
        }
        record.revive(self.clock.now())?;
        self.write(&mut record, TaskStatus::Failed).await?;
        info!(task_id = %record.id, queue = %record.queue, "task retried by operator");
        Ok(record)
    }

    async fn apply(&self, action: OperatorAction, id: &TaskId) -> QueueResult<TaskRecord> {
        match action {
            OperatorAction::Retry => self.retry(id).await,
            OperatorAction::Skip => self.skip(id).await,
            OperatorAction::Cancel => self.cancel(id, None).await,
        }
    }

    async fn run_batch(&self, action: OperatorAction, ids: &[TaskId]) -> BatchReport {
        let mut report = BatchReport::default();
        for id in ids {
            let outcome = self.apply(action, id).await;
            report.record(id.clone(), outcome);
        }
        info!(
            action = ?action,
            succeeded = report.succeeded,
            failed = report.failed,
            "batch finished"
        );
        report
    }

    pub async fn retry_many(&self, ids: &[TaskId]) -> BatchReport {
        self.run_batch(OperatorAction::Retry, ids).await
    }

    pub async fn skip_many(&self, ids: &[TaskId]) -> BatchReport {
        self.run_batch(OperatorAction::Skip, ids).await
    }

    pub async fn cancel_many(&self, ids: &[TaskId]) -> BatchReport {
        self.run_batch(OperatorAction::Cancel, ids).await
    }

    /// Push processing tasks of `queue` whose lease started more than
    /// `lease_timeout` ago back through the retry path.
    ///
    /// Tasks that change concurrently are left alone. Returns the records
    /// that were moved.
    pub async fn reclaim_stale(
        &self,
        queue: &str,
        lease_timeout: Duration,
    ) -> QueueResult<Vec<TaskRecord>> {
        let now = self.clock.now();
        let Some(cutoff) = chrono::Duration::from_std(lease_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
        else {
            return Ok(Vec::new());
        };

        let mut reclaimed = Vec::new();
        for record in self.store.list(Some(queue)).await? {
            if record.status != TaskStatus::Processing
                || record.started_at.is_none_or(|started| started > cutoff)
            {
                continue;
            }
            let error = format!(
                "lease expired after {}s (worker {})",
                lease_timeout.as_secs(),
                record.worker_id.as_deref().unwrap_or("unknown")
            );
            let decision = self.decider.decide(&record, true, &error);
            match self.settle_failure(record, decision).await {
                Ok(record) => reclaimed.push(record),
                Err(QueueError::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if !reclaimed.is_empty() {
            info!(queue, count = reclaimed.len(), "reclaimed stalled tasks");
        }
        Ok(reclaimed)
    }
}

fn eligible_after(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    if delay.is_zero() {
        return None;
    }
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
}
