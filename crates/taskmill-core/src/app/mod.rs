//! Application layer: wiring and the worker runtime.

pub mod builder;
pub mod worker;

pub use self::builder::{App, AppBuilder, BuildError, open_store};
pub use self::worker::WorkerGroup;
