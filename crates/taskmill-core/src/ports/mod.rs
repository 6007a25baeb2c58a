//! Ports - abstraction layer.
//!
//! Each trait is a seam to an external system. The store is the single source
//! of truth for task state, pause flags and alerts; the engine, monitor and
//! controller hold no authoritative state of their own.

pub mod clock;
pub mod id_generator;
pub mod queue_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_store::{InsertOutcome, QueueStore, ReplaceOutcome};
