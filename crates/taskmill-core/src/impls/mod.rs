//! Store implementations.
//!
//! - **InMemoryStore**: single-process store for tests and the demo
//! - **RedisStore**: shared store for multi-process deployments

pub mod memory;
pub mod redis;

pub use self::memory::InMemoryStore;
pub use self::redis::{RedisKeys, RedisStore};
