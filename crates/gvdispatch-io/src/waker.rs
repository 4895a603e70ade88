//! Eventfd waker for the reactor thread.
//!
//! Coalescing: several `wake()` calls before the reactor drains the eventfd
//! produce a single wakeup (eventfd counter semantics).

use gvdispatch_core::kwarn;
use nix::errno::Errno;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub(crate) struct EventFdWaker {
    fd: OwnedFd,
}

impl EventFdWaker {
    /// Create a non-blocking, close-on-exec eventfd
    pub(crate) fn create() -> Result<Self, Errno> {
        let fd = Errno::result(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        // SAFETY: eventfd just returned this descriptor and nothing else owns it
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn wake(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if let Err(e) = Errno::result(ret) {
            // EAGAIN: counter saturated, a wakeup is already pending
            if e != Errno::EAGAIN {
                kwarn!("reactor wake failed: {}", e);
            }
        }
    }

    /// Reset the counter after a wakeup
    pub(crate) fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable(fd: RawFd) -> bool {
        let mut pfd = [libc::pollfd { fd, events: libc::POLLIN, revents: 0 }];
        crate::sys::poll(&mut pfd, 0).unwrap() == 1
    }

    #[test]
    fn test_wake_and_drain() {
        let waker = EventFdWaker::create().unwrap();
        assert!(!readable(waker.fd()));
        waker.wake();
        waker.wake();
        assert!(readable(waker.fd()));
        waker.drain();
        assert!(!readable(waker.fd()));
    }
}
