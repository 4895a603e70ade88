//! # gvdispatch-core
//!
//! Core types shared by every gvdispatch crate.
//!
//! This crate is platform-agnostic apart from errno values and contains no
//! threads, queues or descriptors of its own.
//!
//! ## Modules
//!
//! - `qos` - Quality-of-service classes and queue kinds
//! - `outcome` - Channel kinds and the tagged read/write/cleanup outcomes
//! - `error` - I/O error type
//! - `oneshot` - Single-value completion cell (blocking wait + `Future`)
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities

pub mod qos;
pub mod outcome;
pub mod error;
pub mod oneshot;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use qos::{QosClass, QueueKind};
pub use outcome::{ChannelKind, CleanupOutcome, IoOutcome};
pub use error::{IoError, IoResult};
pub use oneshot::{oneshot, Completion, Promise};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Constants shared across crates
pub mod constants {
    /// Watermark value meaning "no limit"
    pub const WATER_UNLIMITED: usize = usize::MAX;

    /// Largest single read/write syscall issued by the reactor
    pub const MAX_IO_CHUNK: usize = 64 * 1024;

    /// Length value meaning "read until end of stream"
    pub const READ_TO_END: usize = usize::MAX;
}
