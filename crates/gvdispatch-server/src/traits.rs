//! Collaborator contracts
//!
//! The server owns none of the wire format. It drives an [`Acceptor`] for
//! connections, a fresh [`RequestParser`] per connection, a shared
//! [`ResponseSerializer`] and a responder (see [`crate::responder`]).

use crate::error::ServerError;

use std::os::fd::{OwnedFd, RawFd};

/// Source of accepted connections
pub trait Acceptor: Send + Sync + 'static {
    /// Next pending connection, `Ok(None)` when none is waiting.
    ///
    /// Must not block.
    fn accept(&self) -> Result<Option<OwnedFd>, ServerError>;

    /// Descriptor that polls readable when `accept()` has something to return
    fn readiness_fd(&self) -> RawFd;

    /// Stop producing connections and wake anyone waiting on readiness
    fn shutdown(&self);

    fn local_port(&self) -> Result<u16, ServerError>;
}

/// Incremental byte-to-request decoder for one connection
pub trait RequestParser: Send + 'static {
    type Request: Send + 'static;

    /// Feed the next bytes (possibly empty, to re-check buffered input).
    ///
    /// `Ok(None)` means more bytes are needed. Bytes past the end of a
    /// complete request stay buffered for the next call.
    fn parse(&mut self, bytes: &[u8]) -> Result<Option<Self::Request>, ServerError>;

    /// Whether the connection stays open after answering `request`
    fn keep_alive(&self, _request: &Self::Request) -> bool {
        true
    }
}

/// Response-to-bytes encoder, shared by all connections
pub trait ResponseSerializer: Send + Sync + 'static {
    type Response: ErrorResponse + Send + 'static;

    fn serialize(&self, response: &Self::Response) -> Vec<u8>;
}

/// Response types that can express a generic server error
pub trait ErrorResponse {
    fn internal_server_error() -> Self;
}
