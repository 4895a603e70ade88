//! # Request/response server
//!
//! Wires an [`Acceptor`], a parser per connection, one responder and one
//! serializer together:
//!
//! ```text
//!   acceptor ──► TcpStream ──receive──► parser ──► responder ──► serializer
//!      ▲                                                            │
//!      └── when_readable                 keep-alive ◄──send─────────┘
//! ```
//!
//! The accept loop runs on its own serial queue and waits for connections
//! through the reactor, so it never holds a worker while idle. Connections
//! run on the global queue of the configured QoS, one outstanding stream
//! operation at a time.
//!
//! Errors inside a connection (stream failures, parse errors) are answered
//! with a generic server error and the connection is closed. Errors of the
//! accept loop itself go to the failure handler given to `start()`.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::responder::Responder;
use crate::traits::{Acceptor, ErrorResponse, RequestParser, ResponseSerializer};

use gvdispatch_core::{kdebug, kerror, kinfo, ktrace, kwarn, IoError};
use gvdispatch_io::{when_readable, TcpStream};
use gvdispatch_runtime::{global_queue, Queue, QueueKind};

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type FailureHandler = Arc<dyn Fn(ServerError) + Send + Sync + 'static>;
type ParserFactory<P> = Box<dyn Fn() -> P + Send + Sync + 'static>;

/// Default failure handler: log and keep accepting
pub fn log_failure(error: ServerError) {
    kerror!("Error: {}", error);
}

pub struct RequestResponseServer<A, P, S>
where
    A: Acceptor,
    P: RequestParser,
    S: ResponseSerializer,
{
    accept: Arc<AcceptLoop<A, P, S>>,
}

/// Everything a connection needs, shared by all connections
struct Pipeline<P: RequestParser, S: ResponseSerializer> {
    new_parser: ParserFactory<P>,
    responder: Arc<dyn Responder<P::Request, S::Response>>,
    serializer: S,
    max_request_bytes: usize,
    queue: Queue,
    active: AtomicUsize,
}

struct AcceptLoop<A, P: RequestParser, S: ResponseSerializer> {
    acceptor: A,
    pipeline: Arc<Pipeline<P, S>>,
    queue: Queue,
    started: AtomicBool,
    stopped: AtomicBool,
    failure: Mutex<Option<FailureHandler>>,
    batch: usize,
    backoff: Duration,
    accepted: AtomicU64,
}

impl<A, P, S> RequestResponseServer<A, P, S>
where
    A: Acceptor,
    P: RequestParser,
    S: ResponseSerializer,
{
    /// Build a server; nothing is accepted until `start()`.
    ///
    /// `new_parser` makes the parser for each accepted connection.
    pub fn new<F, R>(
        acceptor: A,
        new_parser: F,
        responder: R,
        serializer: S,
        config: &ServerConfig,
    ) -> Result<Self, ServerError>
    where
        F: Fn() -> P + Send + Sync + 'static,
        R: Responder<P::Request, S::Response>,
    {
        config.validate()?;
        let pipeline = Arc::new(Pipeline {
            new_parser: Box::new(new_parser),
            responder: Arc::new(responder),
            serializer,
            max_request_bytes: config.max_request_bytes,
            queue: global_queue(config.qos),
            active: AtomicUsize::new(0),
        });
        let queue = Queue::builder()
            .label("gvd.server.accept")
            .kind(QueueKind::Serial)
            .qos(config.qos)
            .build();
        Ok(RequestResponseServer {
            accept: Arc::new(AcceptLoop {
                acceptor,
                pipeline,
                queue,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                failure: Mutex::new(None),
                batch: config.accept_batch,
                backoff: Duration::from_millis(config.accept_backoff_ms),
                accepted: AtomicU64::new(0),
            }),
        })
    }

    /// Begin accepting. Accept-loop errors go to `failure_handler`; the loop
    /// keeps running after reporting them.
    pub fn start<F>(&self, failure_handler: F)
    where
        F: Fn(ServerError) + Send + Sync + 'static,
    {
        if self.accept.stopped.load(Ordering::Acquire) {
            kwarn!("server was stopped; not starting again");
            return;
        }
        if self.accept.started.swap(true, Ordering::AcqRel) {
            kwarn!("server already started");
            return;
        }
        *self.accept.failure_slot() = Some(Arc::new(failure_handler));
        match self.accept.acceptor.local_port() {
            Ok(port) => kinfo!("accepting connections on port {}", port),
            Err(e) => kwarn!("accepting connections (port unknown: {})", e),
        }
        let accept = Arc::clone(&self.accept);
        self.accept.queue.async_exec(move || accept.run());
    }

    /// `start()` with [`log_failure`]
    pub fn start_default(&self) {
        self.start(log_failure);
    }

    /// Stop accepting. Connections already accepted finish on their own.
    pub fn stop(&self) {
        if !self.accept.stopped.swap(true, Ordering::AcqRel) {
            self.accept.acceptor.shutdown();
            kinfo!(
                "server stopped after {} connections",
                self.accept.accepted.load(Ordering::Relaxed)
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.accept.started.load(Ordering::Acquire) && !self.accept.stopped.load(Ordering::Acquire)
    }

    pub fn local_port(&self) -> Result<u16, ServerError> {
        self.accept.acceptor.local_port()
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> u64 {
        self.accept.accepted.load(Ordering::Relaxed)
    }

    /// Connections accepted and not yet closed
    pub fn active_connections(&self) -> usize {
        self.accept.pipeline.active.load(Ordering::Relaxed)
    }

    pub fn acceptor(&self) -> &A {
        &self.accept.acceptor
    }
}

impl<A, P, S> Drop for RequestResponseServer<A, P, S>
where
    A: Acceptor,
    P: RequestParser,
    S: ResponseSerializer,
{
    fn drop(&mut self) {
        self.stop();
    }
}

impl<A, P, S> AcceptLoop<A, P, S>
where
    A: Acceptor,
    P: RequestParser,
    S: ResponseSerializer,
{
    fn failure_slot(&self) -> MutexGuard<'_, Option<FailureHandler>> {
        self.failure.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, error: ServerError) {
        let handler = self.failure_slot().clone();
        match handler {
            Some(handler) => handler(error),
            None => log_failure(error),
        }
    }

    /// Accept up to one batch of pending connections, then wait for more
    fn run(self: Arc<Self>) {
        for _ in 0..self.batch {
            if self.stopped.load(Ordering::Acquire) {
                ktrace!("accept loop finished");
                return;
            }
            match self.acceptor.accept() {
                Ok(Some(fd)) => {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    Connection::start(&self.pipeline, fd);
                }
                Ok(None) => {
                    self.wait_readable();
                    return;
                }
                Err(_) if self.stopped.load(Ordering::Acquire) => return,
                Err(e) => {
                    self.report(e);
                    self.retry_later();
                    return;
                }
            }
        }
        // Batch used up; requeue behind whatever else is waiting
        let this = Arc::clone(&self);
        self.queue.async_exec(move || this.run());
    }

    fn wait_readable(self: &Arc<Self>) {
        let this = Arc::clone(self);
        if let Err(e) = when_readable(self.acceptor.readiness_fd(), &self.queue, move |_| this.run()) {
            self.report(ServerError::Io(e));
            self.retry_later();
        }
    }

    fn retry_later(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.queue.after(self.backoff, move || this.run());
    }
}

/// One accepted connection, alive while a stream operation or a responder
/// holds it
struct Connection<P: RequestParser, S: ResponseSerializer> {
    stream: TcpStream,
    parser: Mutex<P>,
    /// Bytes received toward the current request
    received: AtomicUsize,
    pipeline: Arc<Pipeline<P, S>>,
}

impl<P, S> Connection<P, S>
where
    P: RequestParser,
    S: ResponseSerializer,
{
    fn start(pipeline: &Arc<Pipeline<P, S>>, fd: OwnedFd) {
        let stream = TcpStream::with_queue(fd, pipeline.queue.clone());
        ktrace!("connection on fd {}", stream.file_descriptor());
        pipeline.active.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection {
            stream,
            parser: Mutex::new((pipeline.new_parser)()),
            received: AtomicUsize::new(0),
            pipeline: Arc::clone(pipeline),
        });
        conn.receive();
    }

    fn parser(&self) -> MutexGuard<'_, P> {
        self.parser.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receive(self: Arc<Self>) {
        let this = Arc::clone(&self);
        self.stream.receive(move |result| this.on_receive(result));
    }

    fn on_receive(self: Arc<Self>, result: Result<Vec<u8>, IoError>) {
        let bytes = match result {
            Ok(bytes) if bytes.is_empty() => {
                ktrace!("fd {}: peer closed", self.stream.file_descriptor());
                self.stream.close();
                return;
            }
            Ok(bytes) => bytes,
            Err(IoError::Canceled) => return,
            Err(e) => {
                self.fail(ServerError::Io(e));
                return;
            }
        };
        let total = self.received.fetch_add(bytes.len(), Ordering::Relaxed) + bytes.len();
        if total > self.pipeline.max_request_bytes {
            self.fail(ServerError::Parse("request too large"));
            return;
        }
        let parsed = self.parser().parse(&bytes);
        self.dispatch(parsed);
    }

    fn dispatch(self: Arc<Self>, parsed: Result<Option<P::Request>, ServerError>) {
        match parsed {
            Ok(Some(request)) => self.respond(request),
            Ok(None) => self.receive(),
            Err(e) => self.fail(e),
        }
    }

    fn respond(self: Arc<Self>, request: P::Request) {
        self.received.store(0, Ordering::Relaxed);
        let keep_alive = self.parser().keep_alive(&request);
        let this = Arc::clone(&self);
        self.pipeline
            .responder
            .respond(request, Box::new(move |response| this.send_response(&response, keep_alive)));
    }

    fn send_response(self: Arc<Self>, response: &S::Response, keep_alive: bool) {
        let bytes = self.pipeline.serializer.serialize(response);
        let this = Arc::clone(&self);
        self.stream.send(bytes, move |result| match result {
            Ok(()) if keep_alive => {
                // Pipelined requests may already be buffered
                let parsed = this.parser().parse(&[]);
                this.dispatch(parsed);
            }
            Ok(()) => this.stream.close(),
            Err(e) => {
                kdebug!("fd {}: response not sent: {}", this.stream.file_descriptor(), e);
                this.stream.close();
            }
        });
    }

    /// Answer with a generic server error, then close
    fn fail(self: Arc<Self>, error: ServerError) {
        kdebug!("fd {}: {}", self.stream.file_descriptor(), error);
        let response = <S::Response as ErrorResponse>::internal_server_error();
        let bytes = self.pipeline.serializer.serialize(&response);
        let this = Arc::clone(&self);
        self.stream.send(bytes, move |_| this.stream.close());
    }
}

impl<P: RequestParser, S: ResponseSerializer> Drop for Connection<P, S> {
    fn drop(&mut self) {
        self.pipeline.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::TcpAcceptor;
    use crate::http::{HttpParser, HttpSerializer, Request, Response};
    use crate::responder::{callback, respond_with, try_respond_with, ResponseReady};
    use gvdispatch_core::{oneshot, Promise};
    use nix::errno::Errno;
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;
    use std::os::fd::{AsRawFd, RawFd};
    use std::os::unix::net::UnixStream;

    const WAIT: Duration = Duration::from_secs(5);

    type HttpTestServer = RequestResponseServer<TcpAcceptor, HttpParser, HttpSerializer>;

    fn loopback() -> ServerConfig {
        ServerConfig::new().bind_addr(Ipv4Addr::LOCALHOST).port(0)
    }

    fn serve_with<R: Responder<Request, Response>>(config: ServerConfig, responder: R) -> HttpTestServer {
        let acceptor = TcpAcceptor::bind(&config).unwrap();
        let server =
            RequestResponseServer::new(acceptor, HttpParser::new, responder, HttpSerializer::new(), &config)
                .unwrap();
        server.start_default();
        server
    }

    fn serve<R: Responder<Request, Response>>(responder: R) -> HttpTestServer {
        serve_with(loopback(), responder)
    }

    /// Write `request`, read until the server closes
    fn exchange(server: &HttpTestServer, request: &[u8]) -> String {
        let port = server.local_port().unwrap();
        let mut client = std::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        client.set_read_timeout(Some(WAIT)).unwrap();
        client.write_all(request).unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    const GET_CLOSE: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";

    #[test]
    fn test_ok_response() {
        let server = serve(respond_with(|_: Request| Response::ok("OK")));
        let reply = exchange(&server, GET_CLOSE);
        assert_eq!(reply, "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
        assert_eq!(server.accepted(), 1);
    }

    #[test]
    fn test_failing_responder_gets_500() {
        let server = serve(try_respond_with(|_: Request| Err::<Response, _>("no such resource")));
        let reply = exchange(&server, GET_CLOSE);
        assert!(reply.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{}", reply);
    }

    #[test]
    fn test_panicking_responder_gets_500() {
        let server = serve(respond_with(|_: Request| -> Response { panic!("responder bug") }));
        let reply = exchange(&server, GET_CLOSE);
        assert!(reply.starts_with("HTTP/1.1 500 "), "{}", reply);
    }

    #[test]
    fn test_keep_alive_pipelined() {
        let server = serve(respond_with(|req: Request| Response::ok(req.target)));
        let reply = exchange(
            &server,
            b"GET /first HTTP/1.1\r\n\r\nGET /second HTTP/1.1\r\nConnection: close\r\n\r\n",
        );
        let first = reply.find("/first").unwrap();
        let second = reply.find("/second").unwrap();
        assert!(first < second);
        assert_eq!(reply.matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[test]
    fn test_callback_responder_answers_later() {
        let server = serve(callback(|req: Request, ready: ResponseReady<Response>| {
            gvdispatch_runtime::utility_queue().after(Duration::from_millis(10), move || {
                ready(Response::ok(format!("later {}", req.method)))
            });
        }));
        let reply = exchange(&server, GET_CLOSE);
        assert!(reply.ends_with("\r\n\r\nlater GET"), "{}", reply);
    }

    #[test]
    fn test_malformed_request_gets_500() {
        let server = serve(respond_with(|_: Request| Response::ok("unreachable")));
        let reply = exchange(&server, b"BROKEN\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 500 "), "{}", reply);
        assert!(!reply.contains("unreachable"));
    }

    #[test]
    fn test_oversized_request_gets_500() {
        let server = serve_with(loopback().max_request_bytes(64), respond_with(|_: Request| Response::ok("OK")));
        let mut request = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        request.extend(std::iter::repeat(b'a').take(100));
        let reply = exchange(&server, &request);
        assert!(reply.starts_with("HTTP/1.1 500 "), "{}", reply);
    }

    #[test]
    fn test_stop_refuses_new_connections() {
        let server = serve(respond_with(|_: Request| Response::ok("OK")));
        let port = server.local_port().unwrap();
        assert!(exchange(&server, GET_CLOSE).ends_with("OK"));
        assert!(server.is_running());

        server.stop();
        assert!(!server.is_running());
        std::thread::sleep(Duration::from_millis(50));
        assert!(std::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_err());
    }

    #[test]
    fn test_connections_close_after_response() {
        let server = serve(respond_with(|_: Request| Response::ok("OK")));
        for _ in 0..3 {
            exchange(&server, GET_CLOSE);
        }
        let deadline = std::time::Instant::now() + WAIT;
        while server.active_connections() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(server.accepted(), 3);
        assert_eq!(server.active_connections(), 0);
    }

    /// Fails once, then never has a connection
    struct FlakyAcceptor {
        failed: AtomicBool,
        wake: UnixStream,
        wake_peer: Mutex<UnixStream>,
    }

    impl Acceptor for FlakyAcceptor {
        fn accept(&self) -> Result<Option<OwnedFd>, ServerError> {
            if self.failed.swap(true, Ordering::SeqCst) {
                Ok(None)
            } else {
                Err(ServerError::Accept(IoError::Os(Errno::EMFILE)))
            }
        }

        fn readiness_fd(&self) -> RawFd {
            self.wake.as_raw_fd()
        }

        fn shutdown(&self) {
            let _ = self.wake_peer.lock().unwrap().write_all(b"x");
        }

        fn local_port(&self) -> Result<u16, ServerError> {
            Ok(0)
        }
    }

    #[test]
    fn test_accept_errors_reach_failure_handler() {
        let (wake, wake_peer) = UnixStream::pair().unwrap();
        let acceptor = FlakyAcceptor {
            failed: AtomicBool::new(false),
            wake,
            wake_peer: Mutex::new(wake_peer),
        };
        let server = RequestResponseServer::new(
            acceptor,
            HttpParser::new,
            respond_with(|_: Request| Response::ok("OK")),
            HttpSerializer::new(),
            &ServerConfig::new(),
        )
        .unwrap();

        let (tx, rx) = oneshot();
        let slot: Mutex<Option<Promise<ServerError>>> = Mutex::new(Some(tx));
        server.start(move |e| {
            if let Some(tx) = slot.lock().unwrap().take() {
                tx.complete(e);
            }
        });
        let reported = rx.wait_timeout(WAIT).ok().flatten();
        assert_eq!(reported, Some(ServerError::Accept(IoError::Os(Errno::EMFILE))));
        assert!(server.is_running());
        server.stop();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = loopback();
        let acceptor = TcpAcceptor::bind(&config).unwrap();
        let result = RequestResponseServer::new(
            acceptor,
            HttpParser::new,
            respond_with(|_: Request| Response::ok("OK")),
            HttpSerializer::new(),
            &config.max_request_bytes(0),
        );
        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}
