//! # gvdispatch-io
//!
//! Asynchronous byte I/O on top of gvdispatch queues.
//!
//! This crate provides:
//! - `IoChannel`: watermark-driven reads and writes on one descriptor, with
//!   per-operation ordered delivery and exactly-once cleanup
//! - `TcpStream`: exactly-once `receive`/`send` over a channel, plus `pipe()`
//!   to hand the descriptor to a fresh stream
//! - `TcpListener`: blocking or non-blocking accept
//! - The reactor: one `poll(2)` thread, woken through an eventfd, which also
//!   offers one-shot readiness watches (`when_readable`)
//!
//! ```text
//!   IoChannel::read/write ──► op queues ──► reactor (poll) ──► syscalls
//!                                                     │
//!   handler(IoOutcome) ◄── delivery (serial per op) ◄─┘  on the caller's Queue
//! ```

pub mod channel;
pub mod config;
pub mod listener;
pub mod reactor;
pub mod stream;
mod sys;
mod waker;

// Re-exports
pub use channel::IoChannel;
pub use config::ReactorConfig;
pub use listener::TcpListener;
pub use reactor::when_readable;
pub use stream::TcpStream;
pub use gvdispatch_core::{ChannelKind, CleanupOutcome, IoError, IoOutcome, IoResult};
