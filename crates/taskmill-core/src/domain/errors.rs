//! Error types for the queue subsystem.
//!
//! `StoreError` covers infrastructure failures (connectivity, encoding). It is
//! always wrapped, never confused with a task that reached `failed`.

use thiserror::Error;

use super::ids::TaskId;
use super::state::TaskStatus;

/// Infrastructure failure reported by a `QueueStore`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("task record encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt store entry: {0}")]
    Corrupt(String),
}

/// Errors returned by the engine, monitor and controller.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Bad task shape. Never enqueued.
    #[error("invalid task: {0}")]
    Validation(String),

    /// A live task already holds this subject (or the explicit id is taken).
    #[error("task for subject '{subject}' already exists as {existing}")]
    AlreadyExists { subject: String, existing: TaskId },

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("alert {0} not found")]
    AlertNotFound(String),

    #[error("task {id} cannot {action} while {from}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        action: &'static str,
    },

    /// The caller does not hold the lease it reported on.
    #[error("task {id} is not leased by worker '{worker_id}'")]
    LeaseMismatch { id: TaskId, worker_id: String },

    /// Another writer changed the task between read and write.
    #[error("task {id} changed concurrently (expected {expected})")]
    Conflict { id: TaskId, expected: TaskStatus },

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl QueueError {
    /// Store/infrastructure errors are worth retrying by the caller; task-level errors are not.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, QueueError::Store(_))
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
