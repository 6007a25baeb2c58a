//! Domain model (ids, task records, status, decisions, alerts, errors).

pub mod alert;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod state;
pub mod task;

pub use alert::{AlertCondition, AlertStatus, HealthAlert, Severity};
pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{QueueError, QueueResult, StoreError};
pub use ids::TaskId;
pub use state::{FailureKind, TaskStatus};
pub use task::{MAX_PRIORITY, NewTask, TaskRecord, TaskType};
