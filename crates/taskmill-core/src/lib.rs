//! taskmill-core
//!
//! A persistent task queue with retries, queue health monitoring and a
//! capacity controller.
//!
//! - **domain**: task records, status machine, alerts, errors
//! - **ports**: `QueueStore`, `Clock`, `IdGenerator`
//! - **impls**: in-memory and Redis stores
//! - **queue**: `TaskQueue` (push, lease, ack/nack, operator actions)
//! - **monitor**: metrics, health evaluation, alerts, cleanup, export
//! - **control**: scaling recommendations, optimize passes, control loop
//! - **typed**: `Task` / `Handler` traits and the handler registry
//! - **app**: `AppBuilder` and the worker runtime
//! - **config**: TOML configuration

pub mod app;
pub mod config;
pub mod control;
pub mod domain;
pub mod impls;
pub mod monitor;
pub mod ports;
pub mod queue;
pub mod typed;
