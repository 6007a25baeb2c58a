//! Queue engine: submission, leasing, retry policy and operator actions.

mod batch;
mod engine;
mod retry;

pub use batch::{BatchItemResult, BatchReport};
pub use engine::{DEFAULT_QUEUE, EngineConfig, Lease, MAX_RETRY_LIMIT, TaskQueue, TaskResult};
pub use retry::RetryPolicy;
