//! Capacity controller: scaling recommendations, optimize passes, pause/resume.

mod capacity;
mod control_loop;
mod optimize;

pub use capacity::{ScalingRecommendation, ScalingTier, ScalingTiers};
pub use control_loop::{
    ControlLoop, ControlLoopHandle, LogSink, MIN_CONTROL_INTERVAL, ScalingSink, SinkError,
};
pub use optimize::{
    Operation, OperationResult, OperationStatus, OptimizationReport, OptimizeOptions,
};

use std::time::Duration;

use tracing::{info, warn};

use crate::domain::{QueueResult, TaskStatus};
use crate::monitor::{QueueMonitor, percentile};
use crate::queue::TaskQueue;

/// Floor for the suggested lease timeout.
const MIN_LEASE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct CapacityController {
    queue: TaskQueue,
    monitor: QueueMonitor,
    tiers: ScalingTiers,
}

impl CapacityController {
    pub fn new(queue: TaskQueue, monitor: QueueMonitor, tiers: ScalingTiers) -> Self {
        Self {
            queue,
            monitor,
            tiers,
        }
    }

    pub fn tiers(&self) -> &ScalingTiers {
        &self.tiers
    }

    /// Every queue the store knows about.
    pub async fn queues(&self) -> QueueResult<Vec<String>> {
        Ok(self.queue.store().queues().await?)
    }

    pub async fn recommend(&self, queue: &str) -> QueueResult<ScalingRecommendation> {
        let metrics = self.monitor.get_queue_metrics(queue).await?;
        let target = self.tiers.target_workers(metrics.pending);
        Ok(ScalingRecommendation {
            queue: queue.to_string(),
            pending: metrics.pending,
            processing: metrics.processing,
            target_workers: target,
            paused: metrics.paused,
            reason: format!("{} pending -> {target} workers", metrics.pending),
            computed_at: metrics.computed_at,
        })
    }

    /// Stop handing out leases for `queue`. Processing tasks are unaffected.
    pub async fn pause(&self, queue: &str) -> QueueResult<()> {
        self.queue.store().set_paused(queue, true).await?;
        info!(queue, "queue paused");
        Ok(())
    }

    pub async fn resume(&self, queue: &str) -> QueueResult<()> {
        self.queue.store().set_paused(queue, false).await?;
        info!(queue, "queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self, queue: &str) -> QueueResult<bool> {
        Ok(self.queue.store().is_paused(queue).await?)
    }

    /// Run the selected maintenance operations on `queue`.
    ///
    /// Operations are independent: one failing is reported and the others
    /// still run.
    pub async fn optimize(&self, queue: &str, options: &OptimizeOptions) -> OptimizationReport {
        let started_at = self.queue.clock().now();
        let mut results = Vec::with_capacity(Operation::ALL.len());

        for operation in Operation::ALL {
            if !options.runs(operation) {
                results.push(OperationResult::skipped(operation, "not requested"));
                continue;
            }
            let result = match operation {
                Operation::Autoscale => self.autoscale(queue, options).await,
                Operation::Cleanup => self.cleanup(queue, options).await,
                Operation::Rebalance => self.rebalance(queue, options).await,
                Operation::TuneWorkers => self.tune_workers(queue, options).await,
            };
            let result = result.unwrap_or_else(|e| {
                warn!(queue, operation = %operation, error = %e, "optimize operation failed");
                OperationResult::failed(operation, e.to_string())
            });
            results.push(result);
        }

        let report =
            OptimizationReport::new(queue, started_at, self.queue.clock().now(), results);
        info!(
            queue,
            success_rate = report.success_rate,
            improvement_score = report.improvement_score,
            "optimize pass finished"
        );
        report
    }

    async fn autoscale(
        &self,
        queue: &str,
        options: &OptimizeOptions,
    ) -> QueueResult<OperationResult> {
        let rec = self.recommend(queue).await?;
        let changed = options
            .current_workers
            .is_some_and(|current| current != rec.target_workers);
        let detail = match options.current_workers {
            Some(current) if changed => format!(
                "scale {current} -> {} workers ({} pending)",
                rec.target_workers, rec.pending
            ),
            _ => format!("{} workers for {} pending", rec.target_workers, rec.pending),
        };
        Ok(OperationResult::succeeded(Operation::Autoscale, changed, detail)
            .with_data(serde_json::json!({ "target_workers": rec.target_workers })))
    }

    async fn cleanup(&self, queue: &str, options: &OptimizeOptions) -> QueueResult<OperationResult> {
        let report = self
            .monitor
            .cleanup_expired_tasks(queue, options.cleanup_max_age)
            .await?;
        Ok(OperationResult::succeeded(
            Operation::Cleanup,
            report.removed > 0,
            format!(
                "removed {} of {} tasks older than {}s",
                report.removed,
                report.examined,
                options.cleanup_max_age.as_secs()
            ),
        )
        .with_data(serde_json::json!({ "removed": report.removed })))
    }

    async fn rebalance(
        &self,
        queue: &str,
        options: &OptimizeOptions,
    ) -> QueueResult<OperationResult> {
        let timeout = options
            .lease_timeout
            .unwrap_or(self.queue.config().lease_timeout);
        let reclaimed = self.queue.reclaim_stale(queue, timeout).await?;
        let ids: Vec<String> = reclaimed.iter().map(|r| r.id.to_string()).collect();
        Ok(OperationResult::succeeded(
            Operation::Rebalance,
            !reclaimed.is_empty(),
            format!(
                "reclaimed {} leases older than {}s",
                reclaimed.len(),
                timeout.as_secs()
            ),
        )
        .with_data(serde_json::json!({ "reclaimed": ids })))
    }

    /// Derive a lease timeout and a worker hint from completed task durations.
    async fn tune_workers(
        &self,
        queue: &str,
        options: &OptimizeOptions,
    ) -> QueueResult<OperationResult> {
        let records = self.queue.store().list(Some(queue)).await?;
        let mut durations: Vec<f64> = records
            .iter()
            .filter(|r| r.status == TaskStatus::Completed)
            .filter_map(|r| r.duration())
            .map(|d| d.num_milliseconds().max(0) as f64 / 1000.0)
            .collect();
        if durations.len() < options.min_samples {
            return Ok(OperationResult::skipped(
                Operation::TuneWorkers,
                format!(
                    "{} completed tasks, need {}",
                    durations.len(),
                    options.min_samples
                ),
            ));
        }
        durations.sort_by(f64::total_cmp);

        let p95 = percentile(&durations, 95.0).unwrap_or_default();
        let avg = durations.iter().sum::<f64>() / durations.len() as f64;
        let pending = records
            .iter()
            .filter(|r| r.status == TaskStatus::Pending)
            .count();

        let suggested_timeout =
            Duration::from_secs_f64((p95 * 3.0).ceil()).max(MIN_LEASE_TIMEOUT);
        let drain_secs = options.drain_target.as_secs_f64().max(1.0);
        let suggested_workers = ((pending as f64 * avg / drain_secs).ceil() as usize)
            .clamp(1, self.tiers.max_workers());

        let current = self.queue.config().lease_timeout.as_secs_f64();
        let drift = (suggested_timeout.as_secs_f64() - current).abs() / current.max(1.0);
        let changed = drift > 0.2;

        Ok(OperationResult::succeeded(
            Operation::TuneWorkers,
            changed,
            format!(
                "p95 {p95:.1}s over {} tasks: lease timeout {}s, {suggested_workers} workers",
                durations.len(),
                suggested_timeout.as_secs()
            ),
        )
        .with_data(serde_json::json!({
            "p95_secs": p95,
            "avg_secs": avg,
            "suggested_lease_timeout_secs": suggested_timeout.as_secs(),
            "suggested_workers": suggested_workers,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;
    use crate::impls::InMemoryStore;
    use crate::impls::memory::fixtures::HookedStore;
    use crate::monitor::MonitorConfig;
    use crate::ports::{FixedClock, QueueStore};
    use crate::queue::{EngineConfig, RetryPolicy};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (TaskQueue, CapacityController, Arc<FixedClock>) {
        setup_with(Arc::new(InMemoryStore::new()))
    }

    fn setup_with(store: Arc<dyn QueueStore>) -> (TaskQueue, CapacityController, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let queue = TaskQueue::new(store.clone(), clock.clone(), EngineConfig::default())
            .with_retry_policy(RetryPolicy::immediate());
        let monitor = QueueMonitor::new(store, clock.clone(), MonitorConfig::default());
        let controller = CapacityController::new(queue.clone(), monitor, ScalingTiers::default());
        (queue, controller, clock)
    }

    async fn push(queue: &TaskQueue, n: usize) {
        for i in 0..n {
            queue
                .push(NewTask::new("notification", json!({ "n": i })))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn recommendation_follows_backlog() {
        let (queue, controller, _) = setup();
        push(&queue, 150).await;
        assert_eq!(controller.recommend("default").await.unwrap().target_workers, 5);

        for _ in 0..145 {
            let lease = queue.lease("default", "w").await.unwrap().unwrap();
            queue.ack(&lease, None).await.unwrap();
        }
        let rec = controller.recommend("default").await.unwrap();
        assert_eq!(rec.pending, 5);
        assert_eq!(rec.target_workers, 1);
    }

    #[tokio::test]
    async fn pause_blocks_leases_until_resume() {
        let (queue, controller, _) = setup();
        push(&queue, 2).await;
        controller.pause("default").await.unwrap();
        assert!(controller.is_paused("default").await.unwrap());
        assert!(queue.lease("default", "w").await.unwrap().is_none());

        controller.resume("default").await.unwrap();
        assert!(!controller.is_paused("default").await.unwrap());
        assert!(queue.lease("default", "w").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn optimize_reports_each_operation() {
        let (queue, controller, clock) = setup();
        push(&queue, 8).await;
        for _ in 0..6 {
            let lease = queue.lease("default", "w").await.unwrap().unwrap();
            clock.advance(chrono::Duration::seconds(20));
            queue.ack(&lease, None).await.unwrap();
        }
        queue.lease("default", "stuck").await.unwrap().unwrap();
        clock.advance(chrono::Duration::minutes(10));

        let options = OptimizeOptions {
            current_workers: Some(3),
            ..OptimizeOptions::default()
        };
        let report = controller.optimize("default", &options).await;

        let status = |op| report.result(op).map(|r| (r.status, r.changed));
        assert_eq!(
            status(Operation::Autoscale),
            Some((OperationStatus::Succeeded, true))
        );
        assert_eq!(
            status(Operation::Cleanup),
            Some((OperationStatus::Succeeded, false))
        );
        assert_eq!(
            status(Operation::Rebalance),
            Some((OperationStatus::Succeeded, true))
        );
        // 20s tasks suggest a 60s lease timeout against the default 300s.
        assert_eq!(
            status(Operation::TuneWorkers),
            Some((OperationStatus::Succeeded, true))
        );
        assert_eq!(report.success_rate, 1.0);
        assert_eq!(report.improvement_score, 87.5);

        let stuck = queue.store().list(Some("default")).await.unwrap();
        assert_eq!(
            stuck
                .iter()
                .filter(|r| r.status == TaskStatus::Processing)
                .count(),
            0
        );
    }

    #[tokio::test]
    async fn optimize_runs_only_selected_operations() {
        let (_, controller, _) = setup();
        let report = controller
            .optimize("default", &OptimizeOptions::only(&[Operation::Cleanup]))
            .await;
        assert_eq!(
            report.result(Operation::Rebalance).map(|r| r.status),
            Some(OperationStatus::Skipped)
        );
        assert_eq!(report.success_rate, 1.0);
        assert_eq!(report.improvement_score, 50.0);
    }

    #[tokio::test]
    async fn failed_operation_does_not_stop_the_others() {
        let (queue, controller, clock) = setup_with(Arc::new(HookedStore::failing_remove()));
        push(&queue, 8).await;
        for _ in 0..6 {
            let lease = queue.lease("default", "w").await.unwrap().unwrap();
            clock.advance(chrono::Duration::seconds(20));
            queue.ack(&lease, None).await.unwrap();
        }
        queue.lease("default", "stuck").await.unwrap().unwrap();
        clock.advance(chrono::Duration::days(8));

        let options = OptimizeOptions {
            current_workers: Some(3),
            ..OptimizeOptions::default()
        };
        let report = controller.optimize("default", &options).await;

        let cleanup = report.result(Operation::Cleanup).unwrap();
        assert_eq!(cleanup.status, OperationStatus::Failed);
        assert!(cleanup.detail.contains("disk full"));
        for op in [
            Operation::Autoscale,
            Operation::Rebalance,
            Operation::TuneWorkers,
        ] {
            let result = report.result(op).map(|r| (r.status, r.changed));
            assert_eq!(result, Some((OperationStatus::Succeeded, true)), "{op}");
        }
        assert_eq!(report.success_rate, 0.75);
        // 25 + 30 + 20 earned of 100 possible.
        assert_eq!(report.improvement_score, 75.0);

        let completed = queue
            .store()
            .list(Some("default"))
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.status == TaskStatus::Completed)
            .count();
        assert_eq!(completed, 6);
    }
}
