//! Futex sleep for Linux workers
//!
//! `signal` is 1 while a wake-up is pending and not yet consumed by a worker.

use super::WorkerParking;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) struct FutexParking {
    signal: AtomicU32,
    sleepers: AtomicUsize,
}

impl FutexParking {
    pub(crate) fn new() -> Self {
        Self {
            signal: AtomicU32::new(0),
            sleepers: AtomicUsize::new(0),
        }
    }

    fn futex(&self, op: libc::c_int, val: u32, timeout: *const libc::timespec) {
        // Outcome is re-derived from `signal`; ETIMEDOUT, EAGAIN and EINTR
        // all just return to the worker loop.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.signal.as_ptr(),
                op | libc::FUTEX_PRIVATE_FLAG,
                val,
                timeout,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl WorkerParking for FutexParking {
    fn park(&self, timeout: Duration, has_work: &dyn Fn() -> bool) {
        self.sleepers.fetch_add(1, Ordering::SeqCst);

        if !has_work() && self.signal.swap(0, Ordering::AcqRel) == 0 {
            let ts = libc::timespec {
                tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                tv_nsec: timeout.subsec_nanos() as libc::c_long,
            };
            // Returns at once if a submitter set `signal` in the meantime
            self.futex(libc::FUTEX_WAIT, 0, &ts);
            self.signal.store(0, Ordering::Release);
        }

        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    fn wake_one(&self) {
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            self.signal.store(1, Ordering::Release);
            self.futex(libc::FUTEX_WAKE, 1, std::ptr::null());
        }
    }

    fn parked_count(&self) -> usize {
        self.sleepers.load(Ordering::Relaxed)
    }
}
