//! Handler trait and its type-erased form.
//!
//! - `Handler<T>`: typed, one per task payload type
//! - `DynHandler`: object-safe, what the registry stores
//! - `TypedHandler<T, H>`: adapter that decodes the JSON payload into `T`

use async_trait::async_trait;
use std::marker::PhantomData;
use thiserror::Error;

use super::task::Task;

/// Failure reported by a handler. The variant decides whether the task is
/// requeued.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Worth another attempt (timeouts, upstream 5xx).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying cannot help.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The payload does not match the registered task type.
    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

pub type HandlerResult = Result<Option<serde_json::Value>, HandlerError>;

/// Executes tasks of type `T`. `Ok(Some(value))` is stored as the task result.
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> HandlerResult;
}

#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: serde_json::Value) -> HandlerResult;
    fn task_type(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, payload: serde_json::Value) -> HandlerResult {
        let task: T = serde_json::from_value(payload)?;
        self.handler.handle(task).await
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{EchoAnalysis, PickyNotifier};
    use super::*;
    use crate::typed::task::{AiAnalysis, Notification};
    use serde_json::json;

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let handler = TypedHandler::<AiAnalysis, _>::new(EchoAnalysis);
        let out = handler.handle_dyn(json!({ "alert_id": 7 })).await.unwrap();
        assert_eq!(out, Some(json!({ "alert_id": 7 })));
        assert_eq!(handler.task_type(), "ai_analysis");
    }

    #[tokio::test]
    async fn bad_payload_is_a_decode_error() {
        let handler = TypedHandler::<AiAnalysis, _>::new(EchoAnalysis);
        let err = handler.handle_dyn(json!({ "alert": "x" })).await.unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn handler_error_kind_drives_retry() {
        let handler = TypedHandler::<Notification, _>::new(PickyNotifier);
        let payload = |recipient: &str| {
            json!({ "channel": "email", "recipient": recipient, "message": "hi" })
        };
        assert!(
            handler
                .handle_dyn(payload("flaky@x"))
                .await
                .unwrap_err()
                .is_retryable()
        );
        assert!(
            !handler
                .handle_dyn(payload("bounce@x"))
                .await
                .unwrap_err()
                .is_retryable()
        );
    }
}
