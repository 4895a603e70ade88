//! Task queues
//!
//! A [`Queue`] is a cheap handle (one `Arc`) onto either a serial or a
//! concurrent stream of tasks.
//!
//! - Concurrent queues hand every task straight to the worker pool at the
//!   queue's QoS class.
//! - Serial queues keep their own FIFO and at most one owner at a time. The
//!   owner is normally a drain job in the pool; it runs up to `serial_batch`
//!   tasks and re-submits itself if more are waiting, so tasks never overlap
//!   and keep submission order while other queues still get a turn.
//! - `sync` never waits for a free worker. On a concurrent queue the closure
//!   runs on the caller. On a serial queue the caller takes ownership once the
//!   tasks ahead of it are done, running them itself if their drain job has
//!   not started yet.
//! - The main queue is serial but is never drained by the pool: the thread
//!   that calls [`run_main`] (or [`drain_main`]) runs its tasks.
//!
//! ```text
//!   serial.async_exec(t) ──► tasks: [t0 t1 t2 ..] ──(draining = false?)──► pool.push(drain)
//!                                                                              │
//!                        worker: drain() runs t0, t1 .. up to batch ◄──────────┘
//! ```

use crate::pool::{pool, run_job, Job};
use crate::timer;

use gvdispatch_core::{ktrace, QosClass, QueueKind};

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

/// Where a queue's work executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Pool,
    Main,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Idle,
    /// A drain job is in the pool and has not started
    Scheduled,
    /// Some thread owns the queue and is running its tasks
    Running,
}

enum Entry {
    Task(Job),
    /// A `sync` caller waiting for its turn
    Sync(u64),
}

struct SerialState {
    tasks: VecDeque<Entry>,
    drain: DrainState,
    /// Ticket of the `sync` caller that has been handed the queue
    granted: Option<u64>,
    next_ticket: u64,
}

/// What the owner of a serial queue does next
enum Next {
    Run(Job),
    /// Ownership passed to a waiting `sync` caller
    Granted,
    Idle,
}

struct QueueInner {
    label: Option<String>,
    kind: QueueKind,
    qos: QosClass,
    target: Target,
    serial: Mutex<SerialState>,
    /// Signalled on submission to the main queue
    main_ready: Condvar,
    /// Signalled when a ticket is granted or a drain job is up for grabs
    sync_ready: Condvar,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, SerialState> {
        self.serial.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the next entry on behalf of the current owner
    fn next(&self) -> Next {
        let mut state = self.lock();
        match state.tasks.pop_front() {
            Some(Entry::Task(job)) => Next::Run(job),
            Some(Entry::Sync(ticket)) => {
                state.granted = Some(ticket);
                self.sync_ready.notify_all();
                Next::Granted
            }
            None => {
                state.drain = DrainState::Idle;
                Next::Idle
            }
        }
    }
}

/// Handle to a task queue. Cloning shares the queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

/// Builder for [`Queue`]
#[derive(Debug, Clone, Default)]
pub struct QueueBuilder {
    label: Option<String>,
    kind: QueueKind,
    qos: QosClass,
}

impl QueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn kind(mut self, kind: QueueKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn qos(mut self, qos: QosClass) -> Self {
        self.qos = qos;
        self
    }

    pub fn build(self) -> Queue {
        Queue::with_target(self.label, self.kind, self.qos, Target::Pool)
    }
}

impl Queue {
    /// New queue at the default QoS class
    pub fn new(label: &str, kind: QueueKind) -> Queue {
        Queue::builder().label(label).kind(kind).build()
    }

    pub fn builder() -> QueueBuilder {
        QueueBuilder::new()
    }

    fn with_target(label: Option<String>, kind: QueueKind, qos: QosClass, target: Target) -> Queue {
        Queue {
            inner: Arc::new(QueueInner {
                label,
                kind,
                qos,
                target,
                serial: Mutex::new(SerialState {
                    tasks: VecDeque::new(),
                    drain: DrainState::Idle,
                    granted: None,
                    next_ticket: 0,
                }),
                main_ready: Condvar::new(),
                sync_ready: Condvar::new(),
            }),
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    pub fn kind(&self) -> QueueKind {
        self.inner.kind
    }

    pub fn qos(&self) -> QosClass {
        self.inner.qos
    }

    /// Whether two handles refer to the same queue
    pub fn same_queue(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Enqueue `f` and return immediately
    pub fn async_exec<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(f));
    }

    /// Run `f` on this queue and block until it has run, returning its value.
    ///
    /// Pool queues run `f` on the calling thread: concurrent queues straight
    /// away, serial queues once every task submitted before it has finished.
    /// Main queue work waits for the thread draining the main queue.
    ///
    /// A panic inside `f` is resumed on the caller. Calling this from a task
    /// already running on the same serial queue deadlocks.
    pub fn sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match (self.inner.kind, self.inner.target) {
            (_, Target::Main) => self.sync_main(f),
            (QueueKind::Concurrent, Target::Pool) => f(),
            (QueueKind::Serial, Target::Pool) => self.sync_serial(f),
        }
    }

    fn sync_serial<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let ticket = {
            let mut state = self.inner.lock();
            if state.drain == DrainState::Idle {
                state.drain = DrainState::Running;
                None
            } else {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.tasks.push_back(Entry::Sync(ticket));
                Some(ticket)
            }
        };
        if let Some(ticket) = ticket {
            self.wait_turn(ticket);
        }

        let result = panic::catch_unwind(AssertUnwindSafe(f));
        release(&self.inner);
        match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Block until `ticket` owns the queue.
    ///
    /// While waiting, a drain job that has not started yet is taken over and
    /// the tasks ahead of `ticket` run on this thread.
    fn wait_turn(&self, ticket: u64) {
        let inner = &self.inner;
        loop {
            {
                let mut state = inner.lock();
                loop {
                    if state.granted == Some(ticket) {
                        state.granted = None;
                        return;
                    }
                    if state.drain == DrainState::Scheduled {
                        state.drain = DrainState::Running;
                        break;
                    }
                    state = inner
                        .sync_ready
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            loop {
                match inner.next() {
                    Next::Run(job) => {
                        run_job(job);
                    }
                    Next::Granted | Next::Idle => break,
                }
            }
        }
    }

    fn sync_main<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        let (promise, completion) = gvdispatch_core::oneshot::<std::thread::Result<R>>();
        let task: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
            promise.complete(panic::catch_unwind(AssertUnwindSafe(f)));
        });
        // SAFETY: `completion.wait()` below does not return until the task has
        // run or been dropped, so nothing borrowed by `f` is used after this
        // frame ends.
        let task: Job = unsafe {
            std::mem::transmute::<Box<dyn FnOnce() + Send + '_>, Job>(task)
        };
        self.submit(task);

        match completion.wait() {
            Some(Ok(value)) => value,
            Some(Err(payload)) => panic::resume_unwind(payload),
            None => unreachable!("sync task dropped before running"),
        }
    }

    /// Enqueue `f` on this queue once `delay` has elapsed
    pub fn after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = self.clone();
        timer::schedule(delay, Box::new(move || queue.async_exec(f)));
    }

    /// [`after`](Self::after) with the delay in seconds.
    ///
    /// Negative or NaN delays run as soon as possible. Delays too large for a
    /// `Duration`, infinity included, are accepted and never come due in
    /// practice.
    pub fn after_secs<F>(&self, secs: f64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX);
        self.after(delay, f);
    }

    fn submit(&self, job: Job) {
        match (self.inner.kind, self.inner.target) {
            (QueueKind::Concurrent, Target::Pool) => pool().push(self.inner.qos, job),
            (_, Target::Main) => {
                self.inner.lock().tasks.push_back(Entry::Task(job));
                self.inner.main_ready.notify_one();
            }
            (QueueKind::Serial, Target::Pool) => {
                let start_drain = {
                    let mut state = self.inner.lock();
                    state.tasks.push_back(Entry::Task(job));
                    if state.drain == DrainState::Idle {
                        state.drain = DrainState::Scheduled;
                        true
                    } else {
                        false
                    }
                };
                if start_drain {
                    schedule_drain(Arc::clone(&self.inner));
                }
            }
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("label", &self.inner.label)
            .field("kind", &self.inner.kind)
            .field("qos", &self.inner.qos)
            .finish()
    }
}

fn schedule_drain(inner: Arc<QueueInner>) {
    let qos = inner.qos;
    pool().push(qos, Box::new(move || drain(inner)));
}

/// Run up to one batch of a serial queue's tasks
fn drain(inner: Arc<QueueInner>) {
    {
        let mut state = inner.lock();
        if state.drain != DrainState::Scheduled {
            // A sync caller took this drain over
            return;
        }
        state.drain = DrainState::Running;
    }

    let batch = pool().config().serial_batch;
    for _ in 0..batch {
        match inner.next() {
            Next::Run(job) => {
                run_job(job);
            }
            Next::Granted | Next::Idle => return,
        }
    }
    if release(&inner) {
        ktrace!("serial queue {:?} yielding after {} tasks", inner.label, batch);
    }
}

/// Give up ownership of a serial pool queue, scheduling a drain if tasks are
/// waiting. Returns whether one was scheduled.
fn release(inner: &Arc<QueueInner>) -> bool {
    let more = {
        let mut state = inner.lock();
        if state.tasks.is_empty() {
            state.drain = DrainState::Idle;
            false
        } else {
            state.drain = DrainState::Scheduled;
            inner.sync_ready.notify_all();
            true
        }
    };
    if more {
        schedule_drain(Arc::clone(inner));
    }
    more
}

// ============================================================================
// Process-wide queues
// ============================================================================

struct Registry {
    main: Queue,
    globals: [Queue; QosClass::COUNT],
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        main: Queue::with_target(
            Some("gvd.main".into()),
            QueueKind::Serial,
            QosClass::UserInteractive,
            Target::Main,
        ),
        globals: std::array::from_fn(|i| {
            let qos = QosClass::from_index(i).unwrap_or_default();
            Queue::with_target(
                Some(format!("gvd.global.{}", qos.name())),
                QueueKind::Concurrent,
                qos,
                Target::Pool,
            )
        }),
    })
}

/// The serial queue drained by [`run_main`]
pub fn main_queue() -> Queue {
    registry().main.clone()
}

/// The concurrent queue of a QoS class
pub fn global_queue(qos: QosClass) -> Queue {
    registry().globals[qos.as_index()].clone()
}

pub fn user_interactive_queue() -> Queue {
    global_queue(QosClass::UserInteractive)
}

pub fn user_initiated_queue() -> Queue {
    global_queue(QosClass::UserInitiated)
}

pub fn default_queue() -> Queue {
    global_queue(QosClass::Default)
}

pub fn utility_queue() -> Queue {
    global_queue(QosClass::Utility)
}

pub fn background_queue() -> Queue {
    global_queue(QosClass::Background)
}

/// Run main queue tasks on the calling thread, forever
pub fn run_main() -> ! {
    let main = &registry().main.inner;
    loop {
        {
            let mut state = main.lock();
            while state.tasks.is_empty() {
                state = main
                    .main_ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        drain_main();
    }
}

/// Run the main queue's pending tasks on the calling thread.
///
/// Returns the number of tasks run; 0 if another thread is already draining.
pub fn drain_main() -> usize {
    let main = &registry().main.inner;
    {
        let mut state = main.lock();
        if state.drain != DrainState::Idle {
            return 0;
        }
        state.drain = DrainState::Running;
    }

    let mut ran = 0;
    loop {
        let job = {
            let mut state = main.lock();
            match state.tasks.pop_front() {
                Some(Entry::Task(job)) => job,
                // Sync tickets are only queued on pool queues
                Some(Entry::Sync(_)) | None => {
                    state.drain = DrainState::Idle;
                    return ran;
                }
            }
        };
        run_job(job);
        ran += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_serial_fifo_across_submitters() {
        let q = Queue::new("test.fifo", QueueKind::Serial);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let submitters: Vec<_> = (0..4)
            .map(|t| {
                let q = q.clone();
                let seen = Arc::clone(&seen);
                let busy = Arc::clone(&busy);
                let overlaps = Arc::clone(&overlaps);
                thread::spawn(move || {
                    for i in 0..100 {
                        let seen = Arc::clone(&seen);
                        let busy = Arc::clone(&busy);
                        let overlaps = Arc::clone(&overlaps);
                        q.async_exec(move || {
                            if busy.swap(true, Ordering::SeqCst) {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            seen.lock().unwrap().push((t, i));
                            busy.store(false, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for s in submitters {
            s.join().unwrap();
        }
        q.sync(|| ());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 400);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        for t in 0..4 {
            let order: Vec<_> = seen.iter().filter(|(st, _)| *st == t).map(|(_, i)| *i).collect();
            assert_eq!(order, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_sync_returns_value_after_prior_tasks() {
        let q = Queue::new("test.sync", QueueKind::Serial);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            q.async_exec(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let observed = q.sync(|| counter.load(Ordering::SeqCst));
        assert_eq!(observed, 50);
    }

    #[test]
    fn test_sync_borrows_caller_stack() {
        let q = default_queue();
        let values = vec![1u64, 2, 3, 4];
        let sum = q.sync(|| values.iter().sum::<u64>());
        assert_eq!(sum, 10);
        assert_eq!(values.len(), 4);
    }

    #[test]
    fn test_sync_propagates_panic() {
        let q = Queue::new("test.panic", QueueKind::Serial);
        let result = panic::catch_unwind(AssertUnwindSafe(|| q.sync(|| panic!("inside sync"))));
        assert!(result.is_err());
        assert_eq!(q.sync(|| 7), 7);
    }

    /// Block until `count` callers have arrived or `limit` has passed
    fn gather(arrived: &AtomicUsize, count: usize, limit: Duration) {
        arrived.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + limit;
        while arrived.load(Ordering::SeqCst) < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_sync_from_every_worker_completes() {
        let workers = pool().config().num_workers;
        let arrived = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let shared = Queue::new("test.sync-shared", QueueKind::Serial);

        for i in 0..workers {
            let arrived = Arc::clone(&arrived);
            let done = Arc::clone(&done);
            let shared = shared.clone();
            default_queue().async_exec(move || {
                gather(&arrived, workers, Duration::from_secs(2));
                let own = Queue::new(&format!("test.sync-target-{}", i), QueueKind::Serial);
                own.sync(|| ());
                shared.async_exec(|| thread::sleep(Duration::from_millis(1)));
                assert_eq!(shared.sync(|| i), i);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while done.load(Ordering::SeqCst) < workers && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::SeqCst), workers);
    }

    #[test]
    fn test_sync_runs_pending_tasks_without_free_worker() {
        let workers = pool().config().num_workers;
        let arrived = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(AtomicBool::new(false));
        for _ in 0..workers {
            let arrived = Arc::clone(&arrived);
            let gate = Arc::clone(&gate);
            default_queue().async_exec(move || {
                arrived.fetch_add(1, Ordering::SeqCst);
                let deadline = Instant::now() + Duration::from_secs(5);
                while !gate.load(Ordering::SeqCst) && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(1));
                }
            });
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while arrived.load(Ordering::SeqCst) < workers && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        let q = Queue::new("test.sync-steal", QueueKind::Serial);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = Arc::clone(&seen);
            q.async_exec(move || seen.lock().unwrap().push(i));
        }
        let observed = q.sync(|| seen.lock().unwrap().clone());
        gate.store(true, Ordering::SeqCst);
        assert_eq!(observed, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_sync_on_concurrent_queue_runs_on_caller() {
        let caller = thread::current().id();
        let q = Queue::new("test.sync-inline", QueueKind::Concurrent);
        let ran_on = q.sync(|| thread::current().id());
        assert_eq!(ran_on, caller);
    }

    #[test]
    fn test_after_huge_delay_never_runs() {
        let fired = Arc::new(AtomicUsize::new(0));
        let q = Queue::new("test.after-huge", QueueKind::Serial);
        for delay in [Duration::MAX, Duration::from_secs(u64::MAX / 2)] {
            let fired = Arc::clone(&fired);
            q.after(delay, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        for secs in [f64::INFINITY, f64::MAX, 1e30] {
            let fired = Arc::clone(&fired);
            q.after_secs(secs, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        thread::sleep(Duration::from_millis(50));
        q.sync(|| ());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_after_respects_delay() {
        let q = Queue::builder().label("test.after").qos(QosClass::Utility).build();
        let start = Instant::now();
        let (tx, rx) = gvdispatch_core::oneshot();
        q.after(Duration::from_millis(50), move || tx.complete(start.elapsed()));
        let elapsed = rx.wait_timeout(Duration::from_secs(5)).ok().flatten();
        assert!(elapsed.expect("after never ran") >= Duration::from_millis(50));
    }

    #[test]
    fn test_after_secs_negative_runs() {
        let (tx, rx) = gvdispatch_core::oneshot();
        utility_queue().after_secs(-1.0, move || tx.complete(()));
        assert!(rx.wait_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_concurrent_queue_runs_in_parallel() {
        let q = Queue::new("test.concurrent", QueueKind::Concurrent);
        let barrier = Arc::new(Barrier::new(2));
        let (tx_a, rx_a) = gvdispatch_core::oneshot();
        let (tx_b, rx_b) = gvdispatch_core::oneshot();
        for tx in [tx_a, tx_b] {
            let barrier = Arc::clone(&barrier);
            q.async_exec(move || {
                barrier.wait();
                tx.complete(());
            });
        }
        assert!(rx_a.wait_timeout(Duration::from_secs(5)).is_ok());
        assert!(rx_b.wait_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_global_queues() {
        assert_eq!(default_queue().qos(), QosClass::Default);
        assert_eq!(background_queue().kind(), QueueKind::Concurrent);
        assert!(user_interactive_queue().same_queue(&global_queue(QosClass::UserInteractive)));
        assert!(!utility_queue().same_queue(&user_initiated_queue()));
        assert_eq!(main_queue().kind(), QueueKind::Serial);
        assert_eq!(main_queue().label(), Some("gvd.main"));
    }

    #[test]
    fn test_drain_main_runs_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = Arc::clone(&seen);
            main_queue().async_exec(move || seen.lock().unwrap().push(i));
        }
        let ran = drain_main();
        assert_eq!(ran, 5);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(drain_main(), 0);
    }

    #[test]
    fn test_serial_survives_panicking_task() {
        let q = Queue::new("test.serial-panic", QueueKind::Serial);
        q.async_exec(|| panic!("task failure"));
        assert_eq!(q.sync(|| "still running"), "still running");
    }
}
