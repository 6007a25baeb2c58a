//! Decision model: what happens to a task after a failed attempt.
//!
//! The decider is a pure function of the record and the failure report. The
//! engine applies the decision to the record and persists it.

use std::time::Duration;

use super::state::FailureKind;
use super::task::TaskRecord;
use crate::queue::RetryPolicy;

/// The next action for a task whose attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Put the task back to pending, eligible after `delay`.
    Retry { delay: Duration, reason: String },

    /// Dead-letter the task.
    MarkFailed { kind: FailureKind, reason: String },
}

/// Decides retry vs dead-letter for a failed attempt.
pub trait Decider: Send + Sync {
    /// # Arguments
    /// * `task` - the record as it was while processing
    /// * `requeue` - whether the worker asked for a retry
    /// * `error` - failure detail reported by the worker
    fn decide(&self, task: &TaskRecord, requeue: bool, error: &str) -> Decision;
}

/// Retry while `retry_count < max_retry`, with backoff from the `RetryPolicy`.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, requeue: bool, error: &str) -> Decision {
        if !requeue {
            return Decision::MarkFailed {
                kind: FailureKind::Rejected,
                reason: error.to_string(),
            };
        }
        if !task.has_retries_left() {
            return Decision::MarkFailed {
                kind: FailureKind::Exhausted,
                reason: format!(
                    "retries exhausted ({}/{}): {error}",
                    task.retry_count, task.max_retry
                ),
            };
        }
        let delay = self.retry_policy.next_delay(task.retry_count + 1);
        Decision::Retry {
            delay,
            reason: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskType};
    use chrono::Utc;

    fn record(retry_count: u32, max_retry: u32) -> TaskRecord {
        let mut r = TaskRecord::new(
            TaskId::new("t"),
            "t".into(),
            TaskType::new("notification"),
            "default".into(),
            serde_json::json!({}),
            0,
            max_retry,
            Utc::now(),
        );
        r.retry_count = retry_count;
        r
    }

    fn decider() -> DefaultDecider {
        DefaultDecider::new(RetryPolicy {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        })
    }

    #[test]
    fn retries_while_budget_remains() {
        let d = decider().decide(&record(1, 3), true, "timeout");
        assert_eq!(
            d,
            Decision::Retry {
                delay: Duration::from_secs(4),
                reason: "timeout".into()
            }
        );
    }

    #[test]
    fn exhausted_budget_marks_failed() {
        let d = decider().decide(&record(3, 3), true, "timeout");
        assert!(matches!(
            d,
            Decision::MarkFailed { kind: FailureKind::Exhausted, .. }
        ));
    }

    #[test]
    fn no_requeue_rejects_even_with_budget() {
        let d = decider().decide(&record(0, 3), false, "bad payload");
        assert_eq!(
            d,
            Decision::MarkFailed {
                kind: FailureKind::Rejected,
                reason: "bad payload".into()
            }
        );
    }
}
