use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::{QueueError, QueueResult};
use super::ids::TaskId;
use super::state::{FailureKind, TaskStatus};

/// Highest accepted priority (lowest is its negation).
pub const MAX_PRIORITY: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub const AI_ANALYSIS: &'static str = "ai_analysis";
    pub const NOTIFICATION: &'static str = "notification";
    pub const RULE_DISTRIBUTION: &'static str = "rule_distribution";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Submission request accepted by `TaskQueue::push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Producer-assigned id. Generated when absent.
    #[serde(default)]
    pub id: Option<TaskId>,

    /// De-duplication key. Falls back to the id.
    #[serde(default)]
    pub subject: Option<String>,

    pub task_type: TaskType,

    #[serde(default)]
    pub queue: Option<String>,

    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default)]
    pub priority: i32,

    /// Falls back to the engine default.
    #[serde(default)]
    pub max_retry: Option<u32>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            subject: None,
            task_type: TaskType::new(task_type),
            queue: None,
            payload,
            priority: 0,
            max_retry: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }
}

/// The task record kept in the store.
///
/// All status changes go through the transition methods below, which check the
/// current status and keep `retry_count <= max_retry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub subject: String,
    pub task_type: TaskType,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retry: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Not eligible for lease before this instant (retry backoff).
    #[serde(default)]
    pub available_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Write counter kept by the store. Every conditional write must carry the
    /// version it read.
    #[serde(default)]
    pub version: u64,
}

impl TaskRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TaskId,
        subject: String,
        task_type: TaskType,
        queue: String,
        payload: serde_json::Value,
        priority: i32,
        max_retry: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            subject,
            task_type,
            queue,
            payload,
            priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retry,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            available_at: None,
            error_message: None,
            failure_kind: None,
            worker_id: None,
            result: None,
            version: 0,
        }
    }

    fn expect_status(&self, allowed: &[TaskStatus], action: &'static str) -> QueueResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                action,
            })
        }
    }

    /// Can a worker lease this task at `now`?
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.available_at.is_none_or(|at| at <= now)
    }

    /// Pending -> Processing. Starts a new attempt.
    pub fn start(&mut self, worker_id: &str, now: DateTime<Utc>) -> QueueResult<()> {
        self.expect_status(&[TaskStatus::Pending], "start")?;
        self.status = TaskStatus::Processing;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(now);
        self.completed_at = None;
        self.available_at = None;
        self.error_message = None;
        self.updated_at = now;
        Ok(())
    }

    /// Processing -> Completed.
    pub fn complete(&mut self, result: Option<serde_json::Value>, now: DateTime<Utc>) -> QueueResult<()> {
        self.expect_status(&[TaskStatus::Processing], "complete")?;
        self.status = TaskStatus::Completed;
        self.result = result;
        self.error_message = None;
        self.worker_id = None;
        // started_at <= completed_at even if the clock stepped backwards.
        let completed = self.started_at.map_or(now, |started| started.max(now));
        self.completed_at = Some(completed);
        self.updated_at = now;
        Ok(())
    }

    /// Processing -> Pending with `retry_count + 1`.
    ///
    /// Refuses when no retries are left; the caller must fail the task instead.
    pub fn requeue(
        &mut self,
        error: String,
        available_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.expect_status(&[TaskStatus::Processing], "requeue")?;
        if !self.has_retries_left() {
            return Err(QueueError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                action: "requeue beyond max_retry",
            });
        }
        self.status = TaskStatus::Pending;
        self.retry_count += 1;
        self.error_message = Some(error);
        self.worker_id = None;
        self.started_at = None;
        self.available_at = available_at;
        self.updated_at = now;
        Ok(())
    }

    /// Pending | Processing -> Failed (dead-letter).
    pub fn fail(&mut self, kind: FailureKind, reason: String, now: DateTime<Utc>) -> QueueResult<()> {
        self.expect_status(&[TaskStatus::Pending, TaskStatus::Processing], "fail")?;
        self.status = TaskStatus::Failed;
        self.failure_kind = Some(kind);
        self.error_message = Some(reason);
        self.worker_id = None;
        self.available_at = None;
        self.completed_at = Some(self.started_at.map_or(now, |started| started.max(now)));
        self.updated_at = now;
        Ok(())
    }

    /// Failed -> Pending. An operator gives the task a fresh retry budget.
    pub fn revive(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        self.expect_status(&[TaskStatus::Failed], "retry")?;
        self.status = TaskStatus::Pending;
        self.retry_count = 0;
        self.error_message = None;
        self.failure_kind = None;
        self.started_at = None;
        self.completed_at = None;
        self.available_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retry
    }

    /// Wall time of the last attempt, for completed or failed tasks that ran.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    /// When the task reached its terminal state.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        if self.status.is_terminal() {
            Some(self.completed_at.unwrap_or(self.updated_at))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn record(max_retry: u32) -> TaskRecord {
        TaskRecord::new(
            TaskId::new("t1"),
            "alert-1".to_string(),
            TaskType::new(TaskType::AI_ANALYSIS),
            "default".to_string(),
            serde_json::json!({"alert_id": 1}),
            0,
            max_retry,
            t0(),
        )
    }

    #[test]
    fn start_then_complete_orders_timestamps() {
        let mut r = record(3);
        r.start("w1", t0()).unwrap();
        assert_eq!(r.status, TaskStatus::Processing);
        assert_eq!(r.worker_id.as_deref(), Some("w1"));

        r.complete(Some(serde_json::json!("ok")), t0() + Duration::seconds(5))
            .unwrap();
        assert_eq!(r.status, TaskStatus::Completed);
        assert!(r.worker_id.is_none());
        assert!(r.started_at.unwrap() <= r.completed_at.unwrap());
        assert_eq!(r.duration(), Some(Duration::seconds(5)));
    }

    #[test]
    fn complete_never_precedes_start() {
        let mut r = record(3);
        r.start("w1", t0()).unwrap();
        r.complete(None, t0() - Duration::seconds(1)).unwrap();
        assert_eq!(r.completed_at, r.started_at);
    }

    #[test]
    fn requeue_increments_retry_count_and_clears_lease() {
        let mut r = record(1);
        r.start("w1", t0()).unwrap();
        r.requeue("boom".into(), Some(t0() + Duration::seconds(2)), t0())
            .unwrap();
        assert_eq!(r.status, TaskStatus::Pending);
        assert_eq!(r.retry_count, 1);
        assert!(r.worker_id.is_none());
        assert!(r.started_at.is_none());
        assert!(!r.is_eligible(t0()));
        assert!(r.is_eligible(t0() + Duration::seconds(2)));
    }

    #[test]
    fn requeue_beyond_max_retry_is_refused() {
        let mut r = record(1);
        r.start("w1", t0()).unwrap();
        r.requeue("e1".into(), None, t0()).unwrap();
        r.start("w1", t0()).unwrap();

        let err = r.requeue("e2".into(), None, t0()).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert_eq!(r.retry_count, 1);
        assert_eq!(r.status, TaskStatus::Processing);
    }

    #[test]
    fn completed_task_cannot_be_failed() {
        let mut r = record(3);
        r.start("w1", t0()).unwrap();
        r.complete(None, t0()).unwrap();
        let err = r
            .fail(FailureKind::Cancelled, "cancelled by user".into(), t0())
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition { from: TaskStatus::Completed, .. }
        ));
    }

    #[test]
    fn revive_resets_retry_budget() {
        let mut r = record(0);
        r.start("w1", t0()).unwrap();
        r.fail(FailureKind::Exhausted, "boom".into(), t0()).unwrap();
        assert_eq!(r.finished_at(), Some(t0()));

        r.revive(t0()).unwrap();
        assert_eq!(r.status, TaskStatus::Pending);
        assert_eq!(r.retry_count, 0);
        assert!(r.failure_kind.is_none());
        assert!(r.finished_at().is_none());
    }
}
