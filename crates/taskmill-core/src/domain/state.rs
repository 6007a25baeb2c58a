//! Task status and terminal failure classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task status.
///
/// State transitions:
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> Pending (requeued, `retry_count` incremented)
/// - Pending -> Processing -> Failed (retries exhausted or rejected)
/// - Pending | Processing -> Failed (cancelled / skipped by an operator)
/// - Failed -> Pending (operator retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a lease (possibly delayed by retry backoff).
    Pending,

    /// Leased by a worker.
    Processing,

    /// Finished successfully.
    Completed,

    /// Dead-lettered. Kept for inspection until cleanup.
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Is this a terminal state (no further transitions without an operator)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Live tasks hold their subject: a second submission is rejected.
    pub fn is_live(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Why a task ended up in the terminal `failed` state.
///
/// Skip and cancel share the terminal state; the kind and the error message
/// tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retries ran out.
    Exhausted,

    /// The worker reported a failure that must not be retried.
    Rejected,

    /// An operator cancelled the task.
    Cancelled,

    /// An operator skipped the task.
    Skipped,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Exhausted => "exhausted",
            FailureKind::Rejected => "rejected",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Skipped => "skipped",
        };
        f.write_str(s)
    }
}
