//! Task trait - binds a payload type to its `task_type` string.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{NewTask, TaskType};

/// A typed task payload.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Reindex { index: String }
///
/// impl Task for Reindex {
///     const TYPE: &'static str = "search.reindex";
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Value stored in `TaskRecord::task_type`.
    const TYPE: &'static str;

    /// Submission for this payload with engine defaults.
    fn to_new_task(&self) -> Result<NewTask, serde_json::Error> {
        Ok(NewTask::new(Self::TYPE, serde_json::to_value(self)?))
    }
}

/// AI analysis of one alert. The subject is usually `alert-<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiAnalysis {
    pub alert_id: u64,
    #[serde(default)]
    pub model: Option<String>,
}

impl Task for AiAnalysis {
    const TYPE: &'static str = TaskType::AI_ANALYSIS;
}

/// Delivery of one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub recipient: String,
    pub message: String,
}

impl Task for Notification {
    const TYPE: &'static str = TaskType::NOTIFICATION;
}

/// Push of a rule to its target agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDistribution {
    pub rule_id: u64,
    #[serde(default)]
    pub targets: Vec<String>,
}

impl Task for RuleDistribution {
    const TYPE: &'static str = TaskType::RULE_DISTRIBUTION;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_carries_type_and_payload() {
        let task = AiAnalysis {
            alert_id: 42,
            model: None,
        }
        .to_new_task()
        .unwrap()
        .with_subject("alert-42");

        assert_eq!(task.task_type.as_str(), "ai_analysis");
        assert_eq!(task.payload["alert_id"], 42);
        assert_eq!(task.subject.as_deref(), Some("alert-42"));
    }
}
