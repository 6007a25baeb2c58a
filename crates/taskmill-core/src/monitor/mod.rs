//! Queue monitor: metrics, health alerts, export and cleanup.
//!
//! Everything is computed from the store on each call. Alerts are the only
//! state the monitor writes, besides deleting expired terminal tasks.

mod health;
mod metrics;

pub use health::{Finding, HealthLevel, HealthStatus, HealthThresholds, evaluate, raise};
pub use metrics::{
    MetricsWindow, QueueMetrics, TaskMetrics, compute_queue_metrics, compute_task_metrics,
    percentile,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{
    AlertCondition, HealthAlert, QueueError, QueueResult, TaskRecord, TaskStatus,
};
use crate::ports::{Clock, QueueStore};

/// Monitor settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Rolling window for failure rate and throughput.
    pub window: Duration,
    /// Processing tasks older than this count as stalled.
    pub lease_timeout: Duration,
    pub thresholds: HealthThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            lease_timeout: Duration::from_secs(300),
            thresholds: HealthThresholds::default(),
        }
    }
}

/// Filter for `QueueMonitor::export_tasks`. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportFilter {
    pub queue: Option<String>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ExportFilter {
    pub fn matches(&self, record: &TaskRecord) -> bool {
        self.queue.as_deref().is_none_or(|q| record.queue == q)
            && self.status.is_none_or(|s| record.status == s)
            && self
                .task_type
                .as_deref()
                .is_none_or(|t| record.task_type.as_str() == t)
            && self.created_after.is_none_or(|at| record.created_at >= at)
            && self.created_before.is_none_or(|at| record.created_at < at)
    }
}

/// Result of `cleanup_expired_tasks`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub queue: String,
    pub cutoff: DateTime<Utc>,
    pub examined: usize,
    pub removed: usize,
}

#[derive(Clone)]
pub struct QueueMonitor {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
}

impl QueueMonitor {
    pub fn new(store: Arc<dyn QueueStore>, clock: Arc<dyn Clock>, config: MonitorConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn window(&self) -> MetricsWindow {
        MetricsWindow {
            now: self.clock.now(),
            window: self.config.window,
            lease_timeout: self.config.lease_timeout,
        }
    }

    pub async fn get_queue_metrics(&self, queue: &str) -> QueueResult<QueueMetrics> {
        let records = self.store.list(Some(queue)).await?;
        let paused = self.store.is_paused(queue).await?;
        Ok(compute_queue_metrics(queue, &records, paused, &self.window()))
    }

    pub async fn get_all_queue_metrics(&self) -> QueueResult<BTreeMap<String, QueueMetrics>> {
        let records = self.store.list(None).await?;
        let window = self.window();
        let mut all = BTreeMap::new();
        for queue in self.store.queues().await? {
            let paused = self.store.is_paused(&queue).await?;
            let metrics = compute_queue_metrics(&queue, &records, paused, &window);
            all.insert(queue, metrics);
        }
        Ok(all)
    }

    pub async fn get_task_metrics(&self, task_type: &str) -> QueueResult<TaskMetrics> {
        let records = self.store.list(None).await?;
        Ok(compute_task_metrics(task_type, &records, &self.window()))
    }

    /// Evaluate every queue, persist raised alerts and resolve cleared ones.
    pub async fn get_health_status(&self) -> QueueResult<BTreeMap<String, HealthStatus>> {
        let now = self.clock.now();
        let metrics = self.get_all_queue_metrics().await?;
        let stored = self.store.list_alerts().await?;

        let mut statuses = BTreeMap::new();
        for (queue, metrics) in metrics {
            let findings = evaluate(&metrics, &self.config.thresholds);
            let mut open = Vec::new();

            for finding in &findings {
                let id = HealthAlert::alert_id(&queue, finding.condition);
                let existing = stored.iter().find(|a| a.id == id).cloned();
                let was_open = existing.as_ref().is_some_and(HealthAlert::is_open);
                let alert = raise(existing, &queue, finding, now);
                self.store.put_alert(&alert).await?;
                if !was_open {
                    warn!(
                        alert_id = %alert.id,
                        severity = ?alert.severity,
                        value = alert.value,
                        threshold = alert.threshold,
                        "{}",
                        alert.title
                    );
                }
                open.push(alert);
            }

            for mut alert in stored
                .iter()
                .filter(|a| a.queue == queue && a.is_open())
                .filter(|a| !findings.iter().any(|f| f.condition == a.condition))
                .cloned()
            {
                alert.resolve(now);
                self.store.put_alert(&alert).await?;
                info!(alert_id = %alert.id, "alert resolved");
            }

            let level = open
                .iter()
                .map(|a| HealthLevel::from(a.severity))
                .max()
                .unwrap_or(HealthLevel::Healthy);
            statuses.insert(
                queue.clone(),
                HealthStatus {
                    queue,
                    level,
                    alerts: open,
                    metrics,
                    checked_at: now,
                },
            );
        }
        Ok(statuses)
    }

    /// Mark an active alert as seen by an operator.
    pub async fn acknowledge_alert(&self, alert_id: &str, by: &str) -> QueueResult<HealthAlert> {
        let mut alert = self
            .store
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| QueueError::AlertNotFound(alert_id.to_string()))?;
        alert.acknowledge(by, self.clock.now());
        self.store.put_alert(&alert).await?;
        info!(alert_id, by, status = ?alert.status, "alert acknowledged");
        Ok(alert)
    }

    pub async fn list_alerts(&self) -> QueueResult<Vec<HealthAlert>> {
        Ok(self.store.list_alerts().await?)
    }

    /// The open alert of `queue` for `condition`, if any.
    pub async fn open_alert(
        &self,
        queue: &str,
        condition: AlertCondition,
    ) -> QueueResult<Option<HealthAlert>> {
        let alert = self
            .store
            .get_alert(&HealthAlert::alert_id(queue, condition))
            .await?;
        Ok(alert.filter(HealthAlert::is_open))
    }

    /// Delete terminal tasks of `queue` that finished more than `max_age` ago.
    ///
    /// Pending and processing tasks are never touched, however old. The delete
    /// is conditional on the status read, so a task revived meanwhile stays.
    pub async fn cleanup_expired_tasks(
        &self,
        queue: &str,
        max_age: Duration,
    ) -> QueueResult<CleanupReport> {
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let records = self.store.list(Some(queue)).await?;
        let mut removed = 0;
        for record in &records {
            let Some(finished) = record.finished_at() else {
                continue;
            };
            if finished >= cutoff {
                continue;
            }
            if self.store.remove(record).await? {
                removed += 1;
                debug!(task_id = %record.id, status = %record.status, "expired task removed");
            }
        }
        info!(queue, examined = records.len(), removed, "cleanup finished");
        Ok(CleanupReport {
            queue: queue.to_string(),
            cutoff,
            examined: records.len(),
            removed,
        })
    }

    /// Bulk export, oldest first.
    pub async fn export_tasks(&self, filter: &ExportFilter) -> QueueResult<Vec<TaskRecord>> {
        let records = self.store.list(filter.queue.as_deref()).await?;
        let mut matching: Vec<TaskRecord> = records
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertStatus, NewTask, Severity};
    use crate::impls::InMemoryStore;
    use crate::ports::FixedClock;
    use crate::queue::{EngineConfig, RetryPolicy, TaskQueue};
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (TaskQueue, QueueMonitor, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryStore::new());
        let queue = TaskQueue::new(store.clone(), clock.clone(), EngineConfig::default())
            .with_retry_policy(RetryPolicy::immediate());
        let monitor = QueueMonitor::new(store, clock.clone(), MonitorConfig::default());
        (queue, monitor, clock)
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
    async fn metrics_track_every_transition() {
        let (queue, monitor, _) = setup();
        push(&queue, 4).await;
        let done = queue.lease("default", "w").await.unwrap().unwrap();
        queue.ack(&done, None).await.unwrap();
        let bad = queue.lease("default", "w").await.unwrap().unwrap();
        queue.nack(&bad, false, "nope").await.unwrap();
        queue.lease("default", "w").await.unwrap().unwrap();

        let m = monitor.get_queue_metrics("default").await.unwrap();
        assert_eq!((m.pending, m.processing, m.completed, m.failed), (1, 1, 1, 1));
        assert_eq!(m.pending + m.processing + m.completed + m.failed, m.total);

        let all = monitor.get_all_queue_metrics().await.unwrap();
        assert_eq!(all["default"], m);
        let t = monitor.get_task_metrics("notification").await.unwrap();
        assert_eq!(t.total, 4);
    }

    #[tokio::test]
    async fn cleanup_never_touches_live_tasks() {
        let (queue, monitor, clock) = setup();
        push(&queue, 3).await;
        let done = queue.lease("default", "w").await.unwrap().unwrap();
        queue.ack(&done, None).await.unwrap();
        queue.lease("default", "w").await.unwrap().unwrap();

        clock.advance(chrono::Duration::days(30));
        let report = monitor
            .cleanup_expired_tasks("default", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(report.examined, 3);
        assert_eq!(report.removed, 1);

        let left = monitor.export_tasks(&ExportFilter::default()).await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|r| r.status.is_live()));
    }

    #[tokio::test]
    async fn cleanup_keeps_recent_terminal_tasks() {
        let (queue, monitor, clock) = setup();
        push(&queue, 1).await;
        let done = queue.lease("default", "w").await.unwrap().unwrap();
        queue.ack(&done, None).await.unwrap();
        clock.advance(chrono::Duration::minutes(5));

        let report = monitor
            .cleanup_expired_tasks("default", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(report.removed, 0);
    }

    #[tokio::test]
    async fn health_raises_and_resolves_alerts() {
        let (queue, monitor, clock) = setup();
        push(&queue, 120).await;

        let health = monitor.get_health_status().await.unwrap();
        let status = &health["default"];
        assert_eq!(status.level, HealthLevel::Degraded);
        assert!(
            status
                .alerts
                .iter()
                .any(|a| a.condition == AlertCondition::BacklogSize
                    && a.severity == Severity::Warning)
        );

        let acked = monitor
            .acknowledge_alert("default:backlog_size", "ops")
            .await
            .unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);

        for _ in 0..120 {
            let lease = queue.lease("default", "w").await.unwrap().unwrap();
            queue.ack(&lease, None).await.unwrap();
        }
        clock.advance(chrono::Duration::seconds(1));
        let health = monitor.get_health_status().await.unwrap();
        assert_eq!(health["default"].level, HealthLevel::Healthy);

        let alerts = monitor.list_alerts().await.unwrap();
        assert!(alerts.iter().all(|a| a.status == AlertStatus::Resolved));
        assert!(
            monitor
                .open_alert("default", AlertCondition::BacklogSize)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn unknown_alert_cannot_be_acknowledged() {
        let (_, monitor, _) = setup();
        let err = monitor.acknowledge_alert("nope", "ops").await.unwrap_err();
        assert!(matches!(err, QueueError::AlertNotFound(_)));
    }

    #[tokio::test]
    async fn export_filters_by_status_type_and_time() {
        let (queue, monitor, clock) = setup();
        push(&queue, 2).await;
        clock.advance(chrono::Duration::hours(1));
        queue
            .push(NewTask::new("ai_analysis", json!({ "alert_id": 1 })).with_queue("ai"))
            .await
            .unwrap();

        let by_type = ExportFilter {
            task_type: Some("ai_analysis".into()),
            ..Default::default()
        };
        assert_eq!(monitor.export_tasks(&by_type).await.unwrap().len(), 1);

        let early = ExportFilter {
            created_before: Some(t0() + chrono::Duration::minutes(1)),
            status: Some(TaskStatus::Pending),
            ..Default::default()
        };
        assert_eq!(monitor.export_tasks(&early).await.unwrap().len(), 2);

        let limited = ExportFilter {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(monitor.export_tasks(&limited).await.unwrap().len(), 1);
    }
}
