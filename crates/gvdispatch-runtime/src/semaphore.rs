//! Counting semaphore
//!
//! `signal` increments the count and wakes one waiter; `wait` takes one unit,
//! blocking while the count is zero. Built on the same mutex/condvar pairing
//! as the fallback worker parking.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How long [`Semaphore::wait`] may block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    #[default]
    Forever,
    After(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Semaphore holding `count` units
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one unit, blocking up to `timeout`.
    ///
    /// Returns `false` if the timeout expired first.
    pub fn wait(&self, timeout: impl Into<Timeout>) -> bool {
        let mut count = self.lock();
        match timeout.into() {
            Timeout::Forever => {
                while *count == 0 {
                    count = self.cond.wait(count).unwrap_or_else(PoisonError::into_inner);
                }
            }
            Timeout::After(d) => {
                let deadline = Instant::now().checked_add(d);
                while *count == 0 {
                    let remaining = match deadline {
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return false;
                            }
                            deadline - now
                        }
                        None => d,
                    };
                    count = self
                        .cond
                        .wait_timeout(count, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        *count -= 1;
        true
    }

    pub fn wait_for(&self, d: Duration) -> bool {
        self.wait(Timeout::After(d))
    }

    /// Take one unit if available, never blocking
    pub fn try_wait(&self) -> bool {
        let mut count = self.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Return one unit, waking a single waiter
    pub fn signal(&self) {
        *self.lock() += 1;
        self.cond.notify_one();
    }

    /// Units currently available
    pub fn available(&self) -> usize {
        *self.lock()
    }
}
