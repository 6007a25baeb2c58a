//! Batch operator actions.

use serde::Serialize;

use crate::domain::{QueueResult, TaskId, TaskRecord};

/// Outcome of one item of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemResult {
    pub task_id: TaskId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-item results plus the tally. A failed item never aborts the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub results: Vec<BatchItemResult>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn record(&mut self, task_id: TaskId, outcome: QueueResult<TaskRecord>) {
        match outcome {
            Ok(_) => {
                self.succeeded += 1;
                self.results.push(BatchItemResult {
                    task_id,
                    success: true,
                    error: None,
                });
            }
            Err(e) => {
                self.failed += 1;
                self.results.push(BatchItemResult {
                    task_id,
                    success: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }
}
