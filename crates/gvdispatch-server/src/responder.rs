//! Responder shapes
//!
//! The server only knows the callback shape: [`Responder::respond`] receives
//! the request and a [`ResponseReady`] to call exactly once. The adapters
//! below lift the other shapes into it:
//!
//! | adapter              | closure                               |
//! |----------------------|---------------------------------------|
//! | [`callback`]         | `Fn(Request, ResponseReady)`          |
//! | [`respond_with`]     | `Fn(Request) -> Response`             |
//! | [`try_respond_with`] | `Fn(Request) -> Result<Response, E>`  |
//!
//! Errors and panics in the synchronous shapes turn into
//! [`ErrorResponse::internal_server_error`].

use crate::traits::ErrorResponse;

use gvdispatch_core::kwarn;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Continuation that delivers the response for one request
pub type ResponseReady<Resp> = Box<dyn FnOnce(Resp) + Send + 'static>;

/// Turns a request into a response, now or later.
///
/// Dropping `ready` without calling it abandons the request; the server then
/// closes the connection.
pub trait Responder<Req, Resp>: Send + Sync + 'static {
    fn respond(&self, request: Req, ready: ResponseReady<Resp>);
}

impl<Req, Resp, R> Responder<Req, Resp> for Arc<R>
where
    R: Responder<Req, Resp> + ?Sized,
{
    fn respond(&self, request: Req, ready: ResponseReady<Resp>) {
        (**self).respond(request, ready)
    }
}

/// See [`callback`]
pub struct Callback<F>(F);

/// See [`respond_with`]
pub struct Pure<F>(F);

/// See [`try_respond_with`]
pub struct Fallible<F>(F);

/// Responder from a closure that calls `ready` itself, possibly later and
/// from another queue
pub fn callback<Req, Resp, F>(f: F) -> Callback<F>
where
    F: Fn(Req, ResponseReady<Resp>) + Send + Sync + 'static,
{
    Callback(f)
}

/// Responder from a function computing the response directly
pub fn respond_with<Req, Resp, F>(f: F) -> Pure<F>
where
    F: Fn(Req) -> Resp + Send + Sync + 'static,
{
    Pure(f)
}

/// Responder from a function that may fail; failures are logged and
/// answered with a generic server error
pub fn try_respond_with<Req, Resp, E, F>(f: F) -> Fallible<F>
where
    F: Fn(Req) -> Result<Resp, E> + Send + Sync + 'static,
    E: fmt::Display,
{
    Fallible(f)
}

impl<Req, Resp, F> Responder<Req, Resp> for Callback<F>
where
    F: Fn(Req, ResponseReady<Resp>) + Send + Sync + 'static,
{
    fn respond(&self, request: Req, ready: ResponseReady<Resp>) {
        (self.0)(request, ready)
    }
}

impl<Req, Resp, F> Responder<Req, Resp> for Pure<F>
where
    Resp: ErrorResponse,
    F: Fn(Req) -> Resp + Send + Sync + 'static,
{
    fn respond(&self, request: Req, ready: ResponseReady<Resp>) {
        let response = match panic::catch_unwind(AssertUnwindSafe(|| (self.0)(request))) {
            Ok(response) => response,
            Err(payload) => {
                kwarn!("responder panicked: {}", panic_message(payload.as_ref()));
                Resp::internal_server_error()
            }
        };
        ready(response);
    }
}

impl<Req, Resp, E, F> Responder<Req, Resp> for Fallible<F>
where
    Resp: ErrorResponse,
    E: fmt::Display,
    F: Fn(Req) -> Result<Resp, E> + Send + Sync + 'static,
{
    fn respond(&self, request: Req, ready: ResponseReady<Resp>) {
        let response = match panic::catch_unwind(AssertUnwindSafe(|| (self.0)(request))) {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                kwarn!("responder failed: {}", e);
                Resp::internal_server_error()
            }
            Err(payload) => {
                kwarn!("responder panicked: {}", panic_message(payload.as_ref()));
                Resp::internal_server_error()
            }
        };
        ready(response);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic>".to_string())
}
