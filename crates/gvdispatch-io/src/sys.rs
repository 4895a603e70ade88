//! Thin syscall wrappers
//!
//! Each wrapper issues exactly one syscall and maps `-1` to the calling
//! thread's errno. Retrying on `EINTR` or `EAGAIN` is the caller's business.

use nix::errno::Errno;
use std::os::fd::RawFd;

/// Switch `fd` to non-blocking mode
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK == 0 {
        Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    }
    Ok(())
}

pub(crate) fn is_socket(fd: RawFd) -> bool {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstat(fd, &mut st) };
    ret == 0 && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// `read(2)`, or `pread(2)` when an offset is given
pub(crate) fn read_at(fd: RawFd, buf: &mut [u8], offset: Option<i64>) -> Result<usize, Errno> {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let n = match offset {
        Some(off) => unsafe { libc::pread(fd, ptr, buf.len(), off as libc::off_t) },
        None => unsafe { libc::read(fd, ptr, buf.len()) },
    };
    Errno::result(n).map(|n| n as usize)
}

/// `write(2)`, `send(2)` without SIGPIPE for sockets, or `pwrite(2)` when an
/// offset is given
pub(crate) fn write_at(
    fd: RawFd,
    buf: &[u8],
    offset: Option<i64>,
    socket: bool,
) -> Result<usize, Errno> {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let n = match offset {
        Some(off) => unsafe { libc::pwrite(fd, ptr, buf.len(), off as libc::off_t) },
        None if socket => unsafe { libc::send(fd, ptr, buf.len(), libc::MSG_NOSIGNAL) },
        None => unsafe { libc::write(fd, ptr, buf.len()) },
    };
    Errno::result(n).map(|n| n as usize)
}

pub(crate) fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> Result<usize, Errno> {
    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    Errno::result(n).map(|n| n as usize)
}

pub(crate) fn set_nodelay(fd: RawFd) -> Result<(), Errno> {
    let opt: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    Errno::result(ret).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_nonblocking_read_would_block() {
        let (a, _b) = UnixStream::pair().unwrap();
        set_nonblocking(a.as_raw_fd()).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(read_at(a.as_raw_fd(), &mut buf, None), Err(Errno::EAGAIN));
        assert!(is_socket(a.as_raw_fd()));
    }

    #[test]
    fn test_write_then_read() {
        let (a, b) = UnixStream::pair().unwrap();
        assert_eq!(write_at(a.as_raw_fd(), b"ping", None, true), Ok(4));
        let mut buf = [0u8; 8];
        assert_eq!(read_at(b.as_raw_fd(), &mut buf, None), Ok(4));
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn test_bad_descriptor() {
        let mut buf = [0u8; 1];
        assert_eq!(read_at(-1, &mut buf, None), Err(Errno::EBADF));
        assert!(!is_socket(-1));
    }
}
