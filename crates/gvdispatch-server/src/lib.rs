//! # gvdispatch-server
//!
//! Request/response servers assembled from gvdispatch streams.
//!
//! This crate provides:
//! - The collaborator traits: `Acceptor`, `RequestParser`,
//!   `ResponseSerializer`
//! - Responder shapes (pure, fallible, callback) normalized to one
//!   callback-style `Responder`
//! - `RequestResponseServer`: accept loop plus per-connection
//!   receive/parse/respond/serialize/send cycle with keep-alive
//! - `TcpAcceptor`, a minimal HTTP/1.1 codec and the `HttpServer` façade
//!
//! ```rust,ignore
//! use gvdispatch_server::{respond_with, HttpServer, Request, Response};
//!
//! let server = HttpServer::new(8080, respond_with(|_: Request| Response::ok("OK")))?;
//! server.start_default();
//! gvdispatch_runtime::run_main();
//! ```

pub mod acceptor;
pub mod config;
pub mod error;
pub mod http;
pub mod http_server;
pub mod responder;
pub mod server;
pub mod traits;

// Re-exports
pub use acceptor::TcpAcceptor;
pub use config::ServerConfig;
pub use error::ServerError;
pub use http::{HttpParser, HttpSerializer, Request, Response, Version};
pub use http_server::HttpServer;
pub use responder::{callback, respond_with, try_respond_with, Responder, ResponseReady};
pub use server::{log_failure, RequestResponseServer};
pub use traits::{Acceptor, ErrorResponse, RequestParser, ResponseSerializer};
