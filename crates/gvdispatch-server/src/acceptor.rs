//! TCP acceptor over a non-blocking [`TcpListener`]

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::traits::Acceptor;

use gvdispatch_core::kwarn;
use gvdispatch_io::TcpListener;

use std::net::SocketAddrV4;
use std::os::fd::{OwnedFd, RawFd};

#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Listen on `config.bind_addr:config.port`
    pub fn bind(config: &ServerConfig) -> Result<TcpAcceptor, ServerError> {
        let addr = SocketAddrV4::new(config.bind_addr, config.port);
        let listener = TcpListener::bind_addr(addr, config.backlog).map_err(ServerError::Accept)?;
        listener.set_nonblocking().map_err(ServerError::Accept)?;
        Ok(TcpAcceptor { listener })
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }
}

impl Acceptor for TcpAcceptor {
    fn accept(&self) -> Result<Option<OwnedFd>, ServerError> {
        self.listener.try_accept().map_err(ServerError::Accept)
    }

    fn readiness_fd(&self) -> RawFd {
        self.listener.fd()
    }

    fn shutdown(&self) {
        self.listener.shutdown();
    }

    fn local_port(&self) -> Result<u16, ServerError> {
        self.listener.local_port().map_err(ServerError::Accept)
    }
}

impl From<TcpListener> for TcpAcceptor {
    /// Wrap an already listening socket, switching it to non-blocking
    fn from(listener: TcpListener) -> Self {
        if let Err(e) = listener.set_nonblocking() {
            kwarn!("listener fd {}: {}", listener.fd(), e);
        }
        TcpAcceptor { listener }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gvdispatch_io::IoError;
    use std::net::Ipv4Addr;

    #[test]
    fn test_bind_and_accept() {
        let config = ServerConfig::new().bind_addr(Ipv4Addr::LOCALHOST).port(0);
        let acceptor = TcpAcceptor::bind(&config).unwrap();
        let port = acceptor.local_port().unwrap();
        assert!(acceptor.accept().unwrap().is_none());

        let _client = std::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            accepted = acceptor.accept().unwrap();
            if accepted.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(accepted.is_some());

        acceptor.shutdown();
        assert_eq!(acceptor.accept().err(), Some(ServerError::Accept(IoError::Closed)));
    }
}
