//! Typed task API.
//!
//! Producers and handlers work with payload structs instead of raw JSON and
//! `task_type` strings.
//!
//! - **surface**: `Task`, `Handler<T>`
//! - **erased**: `DynHandler`, stored in `TypedRegistry`

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{DynHandler, Handler, HandlerError, HandlerResult, TypedHandler};
pub use self::registry::{RegistryError, TypedRegistry};
pub use self::task::{AiAnalysis, Notification, RuleDistribution, Task};
