//! Optimize pass types and scoring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Maintenance operations an optimize pass can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Autoscale,
    Cleanup,
    Rebalance,
    TuneWorkers,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Autoscale,
        Operation::Cleanup,
        Operation::Rebalance,
        Operation::TuneWorkers,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Autoscale => "autoscale",
            Operation::Cleanup => "cleanup",
            Operation::Rebalance => "rebalance",
            Operation::TuneWorkers => "tune_workers",
        }
    }

    /// Share of the improvement score this operation can contribute.
    fn weight(self) -> f64 {
        match self {
            Operation::Autoscale => 25.0,
            Operation::Cleanup => 25.0,
            Operation::Rebalance => 30.0,
            Operation::TuneWorkers => 20.0,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "autoscale" => Ok(Operation::Autoscale),
            "cleanup" => Ok(Operation::Cleanup),
            "rebalance" => Ok(Operation::Rebalance),
            "tune_workers" | "tune-workers" => Ok(Operation::TuneWorkers),
            other => Err(format!("unknown optimize operation '{other}'")),
        }
    }
}

/// What an optimize pass runs, and with which parameters.
#[derive(Debug, Clone)]
pub struct OptimizeOptions {
    pub operations: Vec<Operation>,
    /// Terminal tasks older than this are removed by `cleanup`.
    pub cleanup_max_age: Duration,
    /// Overrides the engine's lease timeout for `rebalance`.
    pub lease_timeout: Option<Duration>,
    /// Workers currently running, if the caller knows. `autoscale` reports a
    /// change only when its target differs.
    pub current_workers: Option<usize>,
    /// `tune_workers` needs at least this many completed tasks.
    pub min_samples: usize,
    /// Backlog drain time `tune_workers` sizes the worker hint for.
    pub drain_target: Duration,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            operations: Operation::ALL.to_vec(),
            cleanup_max_age: Duration::from_secs(7 * 24 * 3600),
            lease_timeout: None,
            current_workers: None,
            min_samples: 5,
            drain_target: Duration::from_secs(300),
        }
    }
}

impl OptimizeOptions {
    pub fn only(operations: &[Operation]) -> Self {
        Self {
            operations: operations.to_vec(),
            ..Self::default()
        }
    }

    pub fn runs(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub operation: Operation,
    pub status: OperationStatus,
    /// Did the operation change anything (tasks moved, removed, a new target)?
    pub changed: bool,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl OperationResult {
    pub fn succeeded(operation: Operation, changed: bool, detail: impl Into<String>) -> Self {
        Self {
            operation,
            status: OperationStatus::Succeeded,
            changed,
            detail: detail.into(),
            data: None,
        }
    }

    pub fn failed(operation: Operation, detail: impl Into<String>) -> Self {
        Self {
            operation,
            status: OperationStatus::Failed,
            changed: false,
            detail: detail.into(),
            data: None,
        }
    }

    pub fn skipped(operation: Operation, detail: impl Into<String>) -> Self {
        Self {
            operation,
            status: OperationStatus::Skipped,
            changed: false,
            detail: detail.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    pub queue: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub operations: Vec<OperationResult>,
    /// Succeeded / ran. Zero when nothing ran.
    pub success_rate: f64,
    /// 0-100. Succeeded operations count fully when they changed something
    /// and half otherwise, weighted per operation over what ran.
    pub improvement_score: f64,
}

impl OptimizationReport {
    pub fn new(
        queue: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        operations: Vec<OperationResult>,
    ) -> Self {
        let ran: Vec<&OperationResult> = operations
            .iter()
            .filter(|op| op.status != OperationStatus::Skipped)
            .collect();
        let succeeded = ran
            .iter()
            .filter(|op| op.status == OperationStatus::Succeeded)
            .count();

        let success_rate = if ran.is_empty() {
            0.0
        } else {
            succeeded as f64 / ran.len() as f64
        };

        let possible: f64 = ran.iter().map(|op| op.operation.weight()).sum();
        let earned: f64 = ran
            .iter()
            .filter(|op| op.status == OperationStatus::Succeeded)
            .map(|op| {
                let factor = if op.changed { 1.0 } else { 0.5 };
                op.operation.weight() * factor
            })
            .sum();
        let improvement_score = if possible > 0.0 {
            (earned / possible * 1000.0).round() / 10.0
        } else {
            0.0
        };

        Self {
            queue: queue.to_string(),
            started_at,
            finished_at,
            operations,
            success_rate,
            improvement_score,
        }
    }

    pub fn result(&self, operation: Operation) -> Option<&OperationResult> {
        self.operations.iter().find(|op| op.operation == operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn report(operations: Vec<OperationResult>) -> OptimizationReport {
        let now = Utc::now();
        OptimizationReport::new("default", now, now, operations)
    }

    #[test]
    fn nothing_ran_scores_zero() {
        let r = report(vec![OperationResult::skipped(
            Operation::Cleanup,
            "not requested",
        )]);
        assert_eq!(r.success_rate, 0.0);
        assert_eq!(r.improvement_score, 0.0);
    }

    #[test]
    fn skipped_operations_do_not_count_as_run() {
        let r = report(vec![
            OperationResult::succeeded(Operation::Cleanup, true, "removed 3"),
            OperationResult::failed(Operation::Rebalance, "store down"),
            OperationResult::skipped(Operation::TuneWorkers, "not enough samples"),
        ]);
        assert_eq!(r.success_rate, 0.5);
        // 25 earned of 25 + 30 possible.
        assert_eq!(r.improvement_score, 45.5);
    }

    #[test]
    fn unchanged_success_earns_half() {
        let r = report(vec![
            OperationResult::succeeded(Operation::Autoscale, false, "target unchanged"),
            OperationResult::succeeded(Operation::Cleanup, true, "removed 1"),
        ]);
        assert_eq!(r.success_rate, 1.0);
        assert_eq!(r.improvement_score, 75.0);
    }

    #[rstest]
    #[case("autoscale", Operation::Autoscale)]
    #[case("tune-workers", Operation::TuneWorkers)]
    #[case("tune_workers", Operation::TuneWorkers)]
    fn parses_operation_names(#[case] name: &str, #[case] expected: Operation) {
        assert_eq!(name.parse::<Operation>().unwrap(), expected);
    }
}
