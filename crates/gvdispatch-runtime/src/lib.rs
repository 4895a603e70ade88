//! # gvdispatch-runtime
//!
//! Dispatch-style task queues on a fixed pool of worker threads.
//!
//! This crate provides:
//! - Worker pool with one run queue per QoS class
//! - Serial and concurrent queues, plus the process-wide queue registry
//! - Delayed submission through a single timer thread
//! - Counting semaphore
//! - Worker parking (futex on Linux, condvar elsewhere)
//!
//! Components never spawn threads themselves; everything runs on the pool
//! started by [`init`] or lazily on first submission.

pub mod config;
mod parking;
pub mod pool;
pub mod queue;
pub mod semaphore;
pub mod timer;

// Re-exports
pub use config::{ConfigError, RuntimeConfig};
pub use pool::{init, is_initialized, stats, PoolStats};
pub use queue::{
    background_queue, default_queue, drain_main, global_queue, main_queue, run_main,
    user_initiated_queue, user_interactive_queue, utility_queue, Queue, QueueBuilder,
};
pub use semaphore::{Semaphore, Timeout};
pub use gvdispatch_core::{QosClass, QueueKind};
