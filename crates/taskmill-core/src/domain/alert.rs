//! Health alerts raised by the queue monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

/// Alert lifecycle: `Active -> Acknowledged -> Resolved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

/// Named threshold conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    HighErrorRate,
    BacklogSize,
    BacklogAge,
    StalledProcessing,
}

impl AlertCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertCondition::HighErrorRate => "high_error_rate",
            AlertCondition::BacklogSize => "backlog_size",
            AlertCondition::BacklogAge => "backlog_age",
            AlertCondition::StalledProcessing => "stalled_processing",
        }
    }
}

impl fmt::Display for AlertCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted alert. One record per `(queue, condition)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub id: String,
    pub queue: String,
    pub condition: AlertCondition,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub status: AlertStatus,
    pub raised_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HealthAlert {
    pub fn alert_id(queue: &str, condition: AlertCondition) -> String {
        format!("{queue}:{condition}")
    }

    pub fn is_open(&self) -> bool {
        self.status != AlertStatus::Resolved
    }

    pub fn acknowledge(&mut self, by: &str, now: DateTime<Utc>) {
        if self.status == AlertStatus::Active {
            self.status = AlertStatus::Acknowledged;
            self.acknowledged_by = Some(by.to_string());
            self.acknowledged_at = Some(now);
            self.updated_at = now;
        }
    }

    pub fn resolve(&mut self, now: DateTime<Utc>) {
        if self.is_open() {
            self.status = AlertStatus::Resolved;
            self.resolved_at = Some(now);
            self.updated_at = now;
        }
    }
}
