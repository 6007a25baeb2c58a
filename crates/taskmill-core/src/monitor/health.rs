//! Health rules and alert bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AlertCondition, AlertStatus, HealthAlert, Severity};

use super::metrics::QueueMetrics;

/// Threshold rules applied to `QueueMetrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    /// Error rate is only judged once this many tasks finished in the window.
    pub error_rate_min_samples: usize,
    pub backlog_warning: usize,
    pub backlog_critical: usize,
    pub backlog_age_warning_secs: f64,
    pub backlog_age_critical_secs: f64,
    /// Any stalled task is a warning; this many is critical.
    pub stalled_critical: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            error_rate_warning: 0.10,
            error_rate_critical: 0.25,
            error_rate_min_samples: 5,
            backlog_warning: 100,
            backlog_critical: 500,
            backlog_age_warning_secs: 300.0,
            backlog_age_critical_secs: 1800.0,
            stalled_critical: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

impl From<Severity> for HealthLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Warning => HealthLevel::Degraded,
            Severity::Critical => HealthLevel::Critical,
        }
    }
}

/// Health of one queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub queue: String,
    pub level: HealthLevel,
    /// Open alerts for the queue after this check.
    pub alerts: Vec<HealthAlert>,
    pub metrics: QueueMetrics,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    /// Is `condition` open at critical severity?
    pub fn has_critical(&self, condition: AlertCondition) -> bool {
        self.alerts
            .iter()
            .any(|a| a.condition == condition && a.severity == Severity::Critical)
    }
}

/// A condition that currently holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub condition: AlertCondition,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub title: String,
    pub message: String,
}

fn grade(value: f64, warning: f64, critical: f64) -> Option<(Severity, f64)> {
    if value >= critical {
        Some((Severity::Critical, critical))
    } else if value >= warning {
        Some((Severity::Warning, warning))
    } else {
        None
    }
}

/// Apply the threshold rules to one queue's metrics.
pub fn evaluate(metrics: &QueueMetrics, thresholds: &HealthThresholds) -> Vec<Finding> {
    let queue = &metrics.queue;
    let mut findings = Vec::new();

    if metrics.finished_in_window >= thresholds.error_rate_min_samples
        && let Some((severity, threshold)) = grade(
            metrics.failure_rate,
            thresholds.error_rate_warning,
            thresholds.error_rate_critical,
        )
    {
        findings.push(Finding {
            condition: AlertCondition::HighErrorRate,
            severity,
            value: metrics.failure_rate,
            threshold,
            title: format!("High error rate on queue {queue}"),
            message: format!(
                "{:.1}% of {} finished tasks failed (threshold {:.1}%)",
                metrics.failure_rate * 100.0,
                metrics.finished_in_window,
                threshold * 100.0
            ),
        });
    }

    if let Some((severity, threshold)) = grade(
        metrics.pending as f64,
        thresholds.backlog_warning as f64,
        thresholds.backlog_critical as f64,
    ) {
        findings.push(Finding {
            condition: AlertCondition::BacklogSize,
            severity,
            value: metrics.pending as f64,
            threshold,
            title: format!("Backlog building up on queue {queue}"),
            message: format!("{} tasks pending (threshold {threshold})", metrics.pending),
        });
    }

    if let Some(age) = metrics.oldest_pending_age_secs
        && let Some((severity, threshold)) = grade(
            age,
            thresholds.backlog_age_warning_secs,
            thresholds.backlog_age_critical_secs,
        )
    {
        findings.push(Finding {
            condition: AlertCondition::BacklogAge,
            severity,
            value: age,
            threshold,
            title: format!("Old tasks waiting on queue {queue}"),
            message: format!("oldest pending task waited {age:.0}s (threshold {threshold:.0}s)"),
        });
    }

    if metrics.stalled > 0 {
        let (severity, threshold) = if metrics.stalled >= thresholds.stalled_critical {
            (Severity::Critical, thresholds.stalled_critical as f64)
        } else {
            (Severity::Warning, 1.0)
        };
        findings.push(Finding {
            condition: AlertCondition::StalledProcessing,
            severity,
            value: metrics.stalled as f64,
            threshold,
            title: format!("Stalled tasks on queue {queue}"),
            message: format!(
                "{} tasks processing longer than the lease timeout",
                metrics.stalled
            ),
        });
    }

    findings
}

/// Merge a finding into the stored alert for the same condition.
///
/// An open alert is refreshed in place (an acknowledgement survives); a
/// resolved or missing one is raised anew.
pub fn raise(
    existing: Option<HealthAlert>,
    queue: &str,
    finding: &Finding,
    now: DateTime<Utc>,
) -> HealthAlert {
    match existing {
        Some(mut alert) if alert.is_open() => {
            alert.severity = finding.severity;
            alert.title = finding.title.clone();
            alert.message = finding.message.clone();
            alert.value = finding.value;
            alert.threshold = finding.threshold;
            alert.updated_at = now;
            alert
        }
        _ => HealthAlert {
            id: HealthAlert::alert_id(queue, finding.condition),
            queue: queue.to_string(),
            condition: finding.condition,
            severity: finding.severity,
            title: finding.title.clone(),
            message: finding.message.clone(),
            value: finding.value,
            threshold: finding.threshold,
            status: AlertStatus::Active,
            raised_at: now,
            updated_at: now,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
        },
    }
}
