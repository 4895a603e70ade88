//! HTTP server: [`RequestResponseServer`] over TCP with the HTTP/1.1 codec

use crate::acceptor::TcpAcceptor;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::http::{HttpParser, HttpSerializer, Request, Response};
use crate::responder::Responder;
use crate::server::RequestResponseServer;

/// Value of the `Server` header on every response
pub const SERVER_NAME: &str = "gvdispatch";

pub struct HttpServer {
    inner: RequestResponseServer<TcpAcceptor, HttpParser, HttpSerializer>,
}

impl HttpServer {
    /// Listen on `port` with the rest of the configuration from the
    /// environment
    pub fn new<R>(port: u16, responder: R) -> Result<HttpServer, ServerError>
    where
        R: Responder<Request, Response>,
    {
        HttpServer::with_config(ServerConfig::from_env().port(port), responder)
    }

    pub fn with_config<R>(config: ServerConfig, responder: R) -> Result<HttpServer, ServerError>
    where
        R: Responder<Request, Response>,
    {
        config.validate()?;
        let acceptor = TcpAcceptor::bind(&config)?;
        let serializer = HttpSerializer::new().server_name(SERVER_NAME);
        let inner = RequestResponseServer::new(acceptor, HttpParser::new, responder, serializer, &config)?;
        Ok(HttpServer { inner })
    }

    pub fn start<F>(&self, failure_handler: F)
    where
        F: Fn(ServerError) + Send + Sync + 'static,
    {
        self.inner.start(failure_handler);
    }

    pub fn start_default(&self) {
        self.inner.start_default();
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn local_port(&self) -> Result<u16, ServerError> {
        self.inner.local_port()
    }

    /// The generic server underneath, for statistics
    pub fn server(&self) -> &RequestResponseServer<TcpAcceptor, HttpParser, HttpSerializer> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::respond_with;
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[test]
    fn test_http_server_round_trip() {
        let config = ServerConfig::new().bind_addr(Ipv4Addr::LOCALHOST).port(0);
        let server = HttpServer::with_config(
            config,
            respond_with(|req: Request| {
                Response::ok(req.body).header("Content-Type", "application/octet-stream")
            }),
        )
        .unwrap();
        server.start_default();

        let port = server.local_port().unwrap();
        let mut client = std::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client
            .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
            .unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();

        assert!(reply.starts_with("HTTP/1.1 200 OK\r\nServer: gvdispatch\r\n"), "{}", reply);
        assert!(reply.ends_with("\r\n\r\nhello"));
        server.stop();
    }

    #[test]
    fn test_bind_conflict_is_accept_error() {
        let config = ServerConfig::new().bind_addr(Ipv4Addr::LOCALHOST).port(0);
        let first = HttpServer::with_config(config.clone(), respond_with(|_: Request| Response::ok(""))).unwrap();
        let taken = config.port(first.local_port().unwrap());
        let second = HttpServer::with_config(taken, respond_with(|_: Request| Response::ok("")));
        assert!(matches!(second, Err(ServerError::Accept(_))));
    }
}
