//! Worker pool
//!
//! A fixed set of OS threads started once per process. Each QoS class has
//! its own lock-free run queue; an idle worker always takes from the highest
//! non-empty class first, then parks.
//!
//! ```text
//!   Queue::async_exec ──► tiers[qos] (SegQueue) ──► worker-N ──► job()
//!                              │                        ▲
//!                              └── wake_one() ──────────┘ (futex / condvar)
//! ```

use crate::config::{ConfigError, RuntimeConfig};
use crate::parking::{new_parking, WorkerParking};

use gvdispatch_core::{kdebug, kerror, kinfo, QosClass};

use crossbeam_queue::SegQueue;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

/// Unit of work executed by a worker
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Pool {
    /// One run queue per QoS class, index 0 = highest
    tiers: [SegQueue<Job>; QosClass::COUNT],
    /// Jobs pushed but not yet popped (all tiers)
    pending: AtomicUsize,
    parking: Box<dyn WorkerParking>,
    config: RuntimeConfig,
    executed: AtomicU64,
    panicked: AtomicU64,
}

static POOL: OnceLock<Arc<Pool>> = OnceLock::new();

/// Start the worker pool with an explicit configuration.
///
/// Must run before the first submission to take effect; afterwards it
/// returns `ConfigError::AlreadyInitialized`.
pub fn init(config: RuntimeConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let mut started = false;
    POOL.get_or_init(|| {
        started = true;
        Pool::start(config)
    });
    if started {
        Ok(())
    } else {
        Err(ConfigError::AlreadyInitialized)
    }
}

/// Whether the pool is running
pub fn is_initialized() -> bool {
    POOL.get().is_some()
}

/// The process-wide pool, started from the environment on first use
pub(crate) fn pool() -> &'static Pool {
    POOL.get_or_init(|| {
        let config = RuntimeConfig::from_env();
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                kerror!("ignoring runtime config from environment: {}", e);
                RuntimeConfig::new()
            }
        };
        Pool::start(config)
    })
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub workers: usize,
    pub pending: usize,
    pub parked: usize,
    pub executed: u64,
    pub panicked: u64,
}

/// Counters of the running pool (zeroes if not started)
pub fn stats() -> PoolStats {
    match POOL.get() {
        Some(p) => PoolStats {
            workers: p.config.num_workers,
            pending: p.pending.load(Ordering::Relaxed),
            parked: p.parking.parked_count(),
            executed: p.executed.load(Ordering::Relaxed),
            panicked: p.panicked.load(Ordering::Relaxed),
        },
        None => PoolStats::default(),
    }
}

impl Pool {
    fn idle(config: RuntimeConfig) -> Pool {
        Pool {
            tiers: std::array::from_fn(|_| SegQueue::new()),
            pending: AtomicUsize::new(0),
            parking: new_parking(),
            config,
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        }
    }

    fn start(config: RuntimeConfig) -> Arc<Pool> {
        let pool = Arc::new(Pool::idle(config));

        let mut spawned = 0;
        for id in 0..pool.config.num_workers {
            let worker_pool = Arc::clone(&pool);
            let result = thread::Builder::new()
                .name(format!("gvd-worker-{}", id))
                .stack_size(pool.config.worker_stack_size)
                .spawn(move || worker_loop(worker_pool, id));
            match result {
                Ok(_) => spawned += 1,
                Err(e) => kerror!("failed to spawn worker {}: {}", id, e),
            }
        }
        kinfo!("worker pool started: {} workers", spawned);
        pool
    }

    /// Publish a job and wake a worker
    pub(crate) fn push(&self, qos: QosClass, job: Job) {
        self.tiers[qos.as_index()].push(job);
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.parking.wake_one();
    }

    /// Highest-class job available
    fn pop(&self) -> Option<Job> {
        if self.pending.load(Ordering::Acquire) == 0 {
            return None;
        }
        for tier in &self.tiers {
            if let Some(job) = tier.pop() {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                return Some(job);
            }
        }
        None
    }

    #[inline]
    fn has_work(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

/// Run a job, keeping the worker alive if it panics
pub(crate) fn run_job(job: Job) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(()) => true,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "<non-string panic>".to_string());
            kerror!("task panicked: {}", msg);
            false
        }
    }
}

fn worker_loop(pool: Arc<Pool>, id: usize) {
    kdebug!("worker {} running", id);
    let mut spins = 0u32;

    loop {
        if let Some(job) = pool.pop() {
            spins = 0;
            if run_job(job) {
                pool.executed.fetch_add(1, Ordering::Relaxed);
            } else {
                pool.panicked.fetch_add(1, Ordering::Relaxed);
            }
            continue;
        }

        if spins < pool.config.idle_spins {
            spins += 1;
            std::hint::spin_loop();
            continue;
        }
        spins = 0;

        pool.parking.park(pool.config.park_timeout, &|| pool.has_work());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gvdispatch_core::oneshot;
    use std::time::Duration;

    #[test]
    fn test_push_runs_job() {
        let (tx, rx) = oneshot();
        pool().push(QosClass::Default, Box::new(move || tx.complete(5)));
        assert_eq!(rx.wait_timeout(Duration::from_secs(5)).ok().flatten(), Some(5));
        assert!(is_initialized());
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        pool().push(QosClass::Utility, Box::new(|| panic!("boom")));
        let (tx, rx) = oneshot();
        pool().push(QosClass::Utility, Box::new(move || tx.complete(())));
        assert!(rx.wait_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_init_after_start_is_rejected() {
        let _ = pool();
        assert_eq!(init(RuntimeConfig::new()), Err(ConfigError::AlreadyInitialized));
        assert!(stats().workers >= 1);
    }

    #[test]
    fn test_pop_prefers_higher_qos() {
        let idle = Pool::idle(RuntimeConfig::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for qos in [QosClass::Background, QosClass::Default, QosClass::UserInteractive] {
            let order = Arc::clone(&order);
            idle.push(qos, Box::new(move || order.lock().unwrap().push(qos)));
        }
        assert!(idle.has_work());
        while let Some(job) = idle.pop() {
            job();
        }
        assert!(!idle.has_work());
        assert_eq!(
            *order.lock().unwrap(),
            vec![QosClass::UserInteractive, QosClass::Default, QosClass::Background]
        );
    }

    #[test]
    fn test_run_job_reports_panic() {
        assert!(run_job(Box::new(|| {})));
        assert!(!run_job(Box::new(|| panic!("expected"))));
    }
}
