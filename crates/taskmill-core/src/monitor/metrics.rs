//! Metric snapshots computed from a full scan of task records.
//!
//! Nothing here keeps running counters: tasks changed by operators or removed
//! by cleanup are reflected on the next read.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::domain::{FailureKind, TaskRecord, TaskStatus};

/// Per-queue snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub queue: String,
    pub total: usize,
    pub pending: usize,
    /// Pending tasks still waiting out a retry backoff (included in `pending`).
    pub delayed: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Processing tasks whose lease is older than the lease timeout.
    pub stalled: usize,
    pub oldest_pending_age_secs: Option<f64>,
    /// Error failures / finished tasks, within the window.
    pub failure_rate: f64,
    /// Finished tasks in the window.
    pub finished_in_window: usize,
    pub throughput_per_minute: f64,
    pub avg_processing_ms: Option<f64>,
    pub paused: bool,
    pub computed_at: DateTime<Utc>,
}

/// Per task-type snapshot across all queues.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskMetrics {
    pub task_type: String,
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub failure_rate: f64,
    pub throughput_per_minute: f64,
    pub avg_duration_ms: Option<f64>,
    pub p50_duration_ms: Option<f64>,
    pub p95_duration_ms: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

/// Time parameters shared by the metric computations.
#[derive(Debug, Clone, Copy)]
pub struct MetricsWindow {
    pub now: DateTime<Utc>,
    /// Rolling window for rates and throughput.
    pub window: Duration,
    /// Processing longer than this counts as stalled.
    pub lease_timeout: Duration,
}

impl MetricsWindow {
    fn since(&self, span: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(span)
            .ok()
            .and_then(|span| self.now.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn window_start(&self) -> DateTime<Utc> {
        self.since(self.window)
    }

    fn minutes(&self) -> f64 {
        (self.window.as_secs_f64() / 60.0).max(f64::EPSILON)
    }
}

/// Operator cancels and skips are bookkeeping, not errors.
fn is_error(record: &TaskRecord) -> bool {
    record.status == TaskStatus::Failed
        && !matches!(
            record.failure_kind,
            Some(FailureKind::Cancelled | FailureKind::Skipped)
        )
}

#[derive(Default)]
struct Tally {
    pending: usize,
    processing: usize,
    completed: usize,
    failed: usize,
    finished_in_window: usize,
    errors_in_window: usize,
    durations_ms: Vec<f64>,
}

impl Tally {
    fn scan<'a>(records: impl Iterator<Item = &'a TaskRecord>, window: &MetricsWindow) -> Self {
        let start = window.window_start();
        let mut tally = Tally::default();
        for record in records {
            match record.status {
                TaskStatus::Pending => tally.pending += 1,
                TaskStatus::Processing => tally.processing += 1,
                TaskStatus::Completed => tally.completed += 1,
                TaskStatus::Failed => tally.failed += 1,
            }
            if let Some(finished) = record.finished_at()
                && finished >= start
            {
                tally.finished_in_window += 1;
                if is_error(record) {
                    tally.errors_in_window += 1;
                }
            }
            if record.status == TaskStatus::Completed
                && let Some(duration) = record.duration()
            {
                tally.durations_ms.push(duration.num_milliseconds() as f64);
            }
        }
        tally
    }

    fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }

    fn failure_rate(&self) -> f64 {
        if self.finished_in_window == 0 {
            0.0
        } else {
            self.errors_in_window as f64 / self.finished_in_window as f64
        }
    }

    fn avg_duration(&self) -> Option<f64> {
        if self.durations_ms.is_empty() {
            None
        } else {
            Some(self.durations_ms.iter().sum::<f64>() / self.durations_ms.len() as f64)
        }
    }
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[index])
}

pub fn compute_queue_metrics(
    queue: &str,
    records: &[TaskRecord],
    paused: bool,
    window: &MetricsWindow,
) -> QueueMetrics {
    let queue_records = || records.iter().filter(move |r| r.queue == queue);
    let tally = Tally::scan(queue_records(), window);
    let stall_cutoff = window.since(window.lease_timeout);

    let mut delayed = 0;
    let mut stalled = 0;
    let mut oldest_pending: Option<DateTime<Utc>> = None;
    for record in queue_records() {
        match record.status {
            TaskStatus::Pending => {
                if !record.is_eligible(window.now) {
                    delayed += 1;
                }
                oldest_pending = Some(match oldest_pending {
                    Some(oldest) => oldest.min(record.created_at),
                    None => record.created_at,
                });
            }
            TaskStatus::Processing => {
                if record.started_at.is_some_and(|started| started <= stall_cutoff) {
                    stalled += 1;
                }
            }
            _ => {}
        }
    }

    QueueMetrics {
        queue: queue.to_string(),
        total: tally.total(),
        pending: tally.pending,
        delayed,
        processing: tally.processing,
        completed: tally.completed,
        failed: tally.failed,
        stalled,
        oldest_pending_age_secs: oldest_pending
            .map(|at| (window.now - at).num_milliseconds().max(0) as f64 / 1000.0),
        failure_rate: tally.failure_rate(),
        finished_in_window: tally.finished_in_window,
        throughput_per_minute: tally.finished_in_window as f64 / window.minutes(),
        avg_processing_ms: tally.avg_duration(),
        paused,
        computed_at: window.now,
    }
}

pub fn compute_task_metrics(
    task_type: &str,
    records: &[TaskRecord],
    window: &MetricsWindow,
) -> TaskMetrics {
    let mut tally = Tally::scan(
        records.iter().filter(|r| r.task_type.as_str() == task_type),
        window,
    );
    tally.durations_ms.sort_by(f64::total_cmp);

    TaskMetrics {
        task_type: task_type.to_string(),
        total: tally.total(),
        pending: tally.pending,
        processing: tally.processing,
        completed: tally.completed,
        failed: tally.failed,
        failure_rate: tally.failure_rate(),
        throughput_per_minute: tally.finished_in_window as f64 / window.minutes(),
        avg_duration_ms: tally.avg_duration(),
        p50_duration_ms: percentile(&tally.durations_ms, 50.0),
        p95_duration_ms: percentile(&tally.durations_ms, 95.0),
        computed_at: window.now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskType};
    use chrono::TimeZone;
    use rstest::rstest;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn window() -> MetricsWindow {
        MetricsWindow {
            now: t0(),
            window: Duration::from_secs(3600),
            lease_timeout: Duration::from_secs(300),
        }
    }

    fn record(id: &str, task_type: &str) -> TaskRecord {
        TaskRecord::new(
            TaskId::new(id),
            id.to_string(),
            TaskType::new(task_type),
            "default".into(),
            serde_json::json!({}),
            0,
            3,
            t0() - chrono::Duration::minutes(30),
        )
    }

    fn completed(id: &str, secs: i64) -> TaskRecord {
        let mut r = record(id, "ai_analysis");
        let started = t0() - chrono::Duration::minutes(20);
        r.start("w", started).unwrap();
        r.complete(None, started + chrono::Duration::seconds(secs))
            .unwrap();
        r
    }

    #[rstest]
    #[case(50.0, Some(3.0))]
    #[case(95.0, Some(5.0))]
    #[case(100.0, Some(5.0))]
    #[case(0.0, Some(1.0))]
    fn nearest_rank_percentile(#[case] p: f64, #[case] expected: Option<f64>) {
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], p), expected);
    }

    #[test]
    fn percentile_of_nothing_is_none() {
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn status_counts_sum_to_total() {
        let mut failed = record("f", "notification");
        failed.start("w", t0()).unwrap();
        failed
            .fail(FailureKind::Exhausted, "boom".into(), t0())
            .unwrap();
        let mut processing = record("p", "notification");
        processing
            .start("w", t0() - chrono::Duration::minutes(10))
            .unwrap();
        let records = vec![
            record("a", "notification"),
            processing,
            completed("c", 2),
            failed,
        ];

        let m = compute_queue_metrics("default", &records, false, &window());
        assert_eq!(m.total, 4);
        assert_eq!(m.pending + m.processing + m.completed + m.failed, m.total);
        assert_eq!(m.stalled, 1);
        assert_eq!(m.finished_in_window, 2);
        assert!((m.failure_rate - 0.5).abs() < 1e-9);
        assert_eq!(m.oldest_pending_age_secs, Some(1800.0));
    }

    #[test]
    fn operator_skips_are_not_errors() {
        let mut skipped = record("s", "notification");
        skipped
            .fail(FailureKind::Skipped, "skipped by operator".into(), t0())
            .unwrap();
        let m = compute_queue_metrics("default", &[skipped], false, &window());
        assert_eq!(m.failed, 1);
        assert_eq!(m.failure_rate, 0.0);
    }

    #[test]
    fn task_metrics_filter_by_type() {
        let records = vec![
            completed("c1", 1),
            completed("c2", 2),
            completed("c3", 10),
            record("n1", "notification"),
        ];
        let m = compute_task_metrics("ai_analysis", &records, &window());
        assert_eq!(m.total, 3);
        assert_eq!(m.completed, 3);
        assert_eq!(m.p50_duration_ms, Some(2000.0));
        assert_eq!(m.p95_duration_ms, Some(10_000.0));
        assert_eq!(m.throughput_per_minute, 3.0 / 60.0);
    }
}
