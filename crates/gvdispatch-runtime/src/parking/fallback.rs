//! Mutex and condvar sleep for platforms without futex

use super::WorkerParking;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

pub(crate) struct FallbackParking {
    /// A wake-up not yet consumed by a worker
    signaled: Mutex<bool>,
    cond: Condvar,
    sleepers: AtomicUsize,
}

impl FallbackParking {
    pub(crate) fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            sleepers: AtomicUsize::new(0),
        }
    }
}

impl WorkerParking for FallbackParking {
    fn park(&self, timeout: Duration, has_work: &dyn Fn() -> bool) {
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        if !*signaled && !has_work() {
            signaled = self
                .cond
                .wait_timeout(signaled, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *signaled = false;
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    fn wake_one(&self) {
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            *self.signaled.lock().unwrap_or_else(PoisonError::into_inner) = true;
            self.cond.notify_one();
        }
    }

    fn parked_count(&self) -> usize {
        self.sleepers.load(Ordering::Relaxed)
    }
}
