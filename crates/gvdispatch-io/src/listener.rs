//! TCP listener
//!
//! `accept()` blocks the calling thread. Accept loops that run on a queue use
//! `set_nonblocking()` plus `try_accept()` instead, and wait for the next
//! connection with [`when_readable`](crate::reactor::when_readable).
//! `shutdown()` wakes both kinds of waiter.

use crate::sys;

use gvdispatch_core::{kdebug, IoError};
use nix::errno::Errno;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

pub const DEFAULT_BACKLOG: i32 = 1024;

pub struct TcpListener {
    fd: OwnedFd,
    shut: AtomicBool,
}

impl TcpListener {
    /// Bind and listen on all interfaces
    pub fn bind(port: u16) -> Result<TcpListener, IoError> {
        TcpListener::bind_addr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port), DEFAULT_BACKLOG)
    }

    /// Socket setup: create, setsockopt, bind, listen
    pub fn bind_addr(addr: SocketAddrV4, backlog: i32) -> Result<TcpListener, IoError> {
        let raw = Errno::result(unsafe {
            libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)
        })?;
        // SAFETY: socket() just returned this descriptor
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let opt: libc::c_int = 1;
        Errno::result(unsafe {
            libc::setsockopt(
                raw,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;

        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
        sin.sin_port = addr.port().to_be();
        Errno::result(unsafe {
            libc::bind(
                raw,
                &sin as *const _ as *const libc::sockaddr,
                std::mem::size_of_val(&sin) as libc::socklen_t,
            )
        })?;
        Errno::result(unsafe { libc::listen(raw, backlog) })?;

        kdebug!("listening on {} (fd {})", addr, raw);
        Ok(TcpListener {
            fd,
            shut: AtomicBool::new(false),
        })
    }

    /// Block until a client connects.
    ///
    /// Returns `IoError::Closed` once `shutdown()` has been called.
    pub fn accept(&self) -> Result<OwnedFd, IoError> {
        loop {
            if let Some(client) = self.try_accept()? {
                return Ok(client);
            }
            // Non-blocking listener with nothing pending: wait for readiness
            let mut pfd = [libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            }];
            match sys::poll(&mut pfd, -1) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(IoError::from(e)),
            }
        }
    }

    /// Accept one pending connection, `Ok(None)` if none is waiting on a
    /// non-blocking listener.
    ///
    /// Returns `IoError::Closed` once `shutdown()` has been called.
    pub fn try_accept(&self) -> Result<Option<OwnedFd>, IoError> {
        loop {
            if self.is_shutdown() {
                return Err(IoError::Closed);
            }
            let ret = unsafe {
                libc::accept4(
                    self.fd.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_CLOEXEC,
                )
            };
            match Errno::result(ret) {
                Ok(client) => {
                    // SAFETY: accept4 just returned this descriptor
                    let client = unsafe { OwnedFd::from_raw_fd(client) };
                    if let Err(e) = sys::set_nodelay(client.as_raw_fd()) {
                        kdebug!("TCP_NODELAY on fd {}: {}", client.as_raw_fd(), e);
                    }
                    return Ok(Some(client));
                }
                Err(Errno::EINTR) | Err(Errno::ECONNABORTED) => continue,
                Err(Errno::EAGAIN) => return Ok(None),
                Err(_) if self.is_shutdown() => return Err(IoError::Closed),
                Err(e) => return Err(IoError::from(e)),
            }
        }
    }

    /// Make `try_accept()` return instead of blocking
    pub fn set_nonblocking(&self) -> Result<(), IoError> {
        sys::set_nonblocking(self.fd.as_raw_fd())?;
        Ok(())
    }

    /// Port actually bound (useful after binding port 0)
    pub fn local_port(&self) -> Result<u16, IoError> {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of_val(&sin) as libc::socklen_t;
        Errno::result(unsafe {
            libc::getsockname(
                self.fd.as_raw_fd(),
                &mut sin as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        Ok(u16::from_be(sin.sin_port))
    }

    /// Stop accepting and wake a blocked `accept()`
    pub fn shutdown(&self) {
        if !self.shut.swap(true, Ordering::AcqRel) {
            unsafe {
                libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR);
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl std::fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListener")
            .field("fd", &self.fd.as_raw_fd())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn loopback() -> TcpListener {
        TcpListener::bind_addr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 16).unwrap()
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = loopback();
        assert_ne!(listener.local_port().unwrap(), 0);
    }

    #[test]
    fn test_accept_connection() {
        let listener = loopback();
        let port = listener.local_port().unwrap();
        let client = std::thread::spawn(move || std::net::TcpStream::connect(("127.0.0.1", port)));
        let accepted = listener.accept().unwrap();
        assert!(accepted.as_raw_fd() >= 0);
        assert!(client.join().unwrap().is_ok());
    }

    #[test]
    fn test_try_accept_nonblocking() {
        let listener = loopback();
        listener.set_nonblocking().unwrap();
        assert!(listener.try_accept().unwrap().is_none());

        let port = listener.local_port().unwrap();
        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            accepted = listener.try_accept().unwrap();
            if accepted.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(accepted.is_some());

        listener.shutdown();
        assert_eq!(listener.try_accept().err(), Some(IoError::Closed));
    }

    #[test]
    fn test_shutdown_unblocks_accept() {
        let listener = Arc::new(loopback());
        let acceptor = Arc::clone(&listener);
        let handle = std::thread::spawn(move || acceptor.accept());
        std::thread::sleep(Duration::from_millis(50));
        listener.shutdown();
        assert_eq!(handle.join().unwrap().err(), Some(IoError::Closed));
        assert!(listener.is_shutdown());
    }
}
