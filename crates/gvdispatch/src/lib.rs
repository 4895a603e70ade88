//! # gvdispatch - dispatch queues and asynchronous I/O
//!
//! Task queues, a counting semaphore and watermark-driven I/O channels on a
//! fixed pool of worker threads, plus a small request/response server built
//! from them.
//!
//! ## Quick Start
//!
//! ```ignore
//! use gvdispatch::{Queue, QueueKind, Semaphore};
//!
//! let queue = Queue::new("com.example.work", QueueKind::Serial);
//! queue.async_exec(|| println!("first"));
//! let answer = queue.sync(|| 42);
//!
//! let slots = Semaphore::new(2);
//! gvdispatch::default_queue().async_exec(move || {
//!     slots.wait(gvdispatch::Timeout::Forever);
//!     // ...
//!     slots.signal();
//! });
//! ```
//!
//! ```ignore
//! use gvdispatch::{respond_with, HttpServer, Request, Response};
//!
//! let server = HttpServer::new(8080, respond_with(|_: Request| Response::ok("OK")))?;
//! server.start_default();
//! gvdispatch::run_main();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │      Queue::async_exec / sync / after, IoChannel, server    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Queues (serial / concurrent)                │
//! │        drain jobs, main queue, process-wide registry        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │   Timer   │      │  Reactor  │
//!    │  threads  │      │   thread  │      │ (poll(2)) │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```

// Re-export core types
pub use gvdispatch_core::{
    oneshot, ChannelKind, CleanupOutcome, Completion, IoError, IoOutcome, IoResult, Promise,
    QosClass, QueueKind,
};
pub use gvdispatch_core::constants::{MAX_IO_CHUNK, READ_TO_END, WATER_UNLIMITED};

// Re-export kprint macros for logging
pub use gvdispatch_core::{kdebug, kerror, kinfo, ktrace, kwarn};
pub use gvdispatch_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use gvdispatch_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use gvdispatch_runtime::{
    background_queue, default_queue, drain_main, global_queue, init, main_queue, run_main,
    user_initiated_queue, user_interactive_queue, utility_queue, ConfigError, PoolStats, Queue,
    QueueBuilder, RuntimeConfig, Semaphore, Timeout,
};

// Re-export I/O types
pub use gvdispatch_io::{when_readable, IoChannel, ReactorConfig, TcpListener, TcpStream};

// Re-export server types
pub use gvdispatch_server::{
    callback, respond_with, try_respond_with, Acceptor, ErrorResponse, HttpParser,
    HttpSerializer, HttpServer, Request, RequestParser, RequestResponseServer, Responder,
    Response, ResponseReady, ResponseSerializer, ServerConfig, ServerError, TcpAcceptor,
};

/// Pool statistics, `None` before the pool has started
pub fn stats() -> Option<PoolStats> {
    gvdispatch_runtime::is_initialized().then(gvdispatch_runtime::stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facade_queue_and_stats() {
        let queue = Queue::new("test.facade", QueueKind::Serial);
        assert_eq!(queue.sync(|| 6 * 7), 42);
        let stats = stats().unwrap();
        assert!(stats.workers >= 1);
    }
}
