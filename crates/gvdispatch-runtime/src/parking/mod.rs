//! Idle worker sleep
//!
//! A worker that finds every run queue empty sleeps here until a submission
//! signals it or the park timeout passes. Linux sleeps on a futex word; other
//! platforms use a mutex and condvar.

use std::time::Duration;

/// Sleep/wake channel shared by the pool's workers and its submitters.
///
/// A submission is never missed: a worker counts itself as sleeping before
/// it re-checks the run queues, and a submitter pushes its job before it
/// reads that count. Both sides use `SeqCst`.
pub(crate) trait WorkerParking: Send + Sync {
    /// Sleep for at most `timeout`, unless `has_work` already holds or a
    /// signal is pending
    fn park(&self, timeout: Duration, has_work: &dyn Fn() -> bool);

    /// Signal one sleeping worker, if any
    fn wake_one(&self);

    /// Workers currently asleep
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        use fallback::FallbackParking as PlatformParking;
    }
}

pub(crate) fn new_parking() -> Box<dyn WorkerParking> {
    Box::new(PlatformParking::new())
}
