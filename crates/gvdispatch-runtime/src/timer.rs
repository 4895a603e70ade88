//! Delayed submission
//!
//! One lazily started thread ("gvd-timer") owns a min-heap of deadlines.
//! When an entry expires its job runs on the timer thread; for `Queue::after`
//! that job is just the re-submission onto the target queue, so user code
//! never runs here.
//!
//! The thread sleeps on a condvar until the earliest deadline, bounded by
//! `RuntimeConfig::timer_max_poll`, and is notified when an earlier entry is
//! inserted.

use crate::pool::{pool, run_job, Job};

use gvdispatch_core::{kdebug, kerror};

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Heap entry, ordered earliest deadline first, then insertion order
struct Entry {
    deadline: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

struct TimerState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

struct Timer {
    state: Mutex<TimerState>,
    cond: Condvar,
    max_poll: Duration,
}

static TIMER: OnceLock<Timer> = OnceLock::new();

fn timer() -> &'static Timer {
    TIMER.get_or_init(|| {
        let max_poll = pool().config().timer_max_poll;
        let spawned = thread::Builder::new()
            .name("gvd-timer".into())
            .spawn(timer_loop);
        if let Err(e) = spawned {
            kerror!("failed to spawn timer thread: {}", e);
        }
        Timer {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            cond: Condvar::new(),
            max_poll,
        }
    })
}

impl Timer {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run `job` on the timer thread once `delay` has elapsed.
///
/// Delays that overflow `Instant` are clamped to [`FAR_FUTURE`].
pub(crate) fn schedule(delay: Duration, job: Job) {
    let deadline = deadline_after(Instant::now(), delay);
    let t = timer();
    let earliest = {
        let mut state = t.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let earliest = state
            .heap
            .peek()
            .map_or(true, |head| deadline < head.deadline);
        state.heap.push(Entry { deadline, seq, job });
        earliest
    };
    if earliest {
        t.cond.notify_one();
    }
}

/// Stand-in delay for deadlines past what `Instant` can represent
const FAR_FUTURE: Duration = Duration::from_secs(u32::MAX as u64);

fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Number of entries not yet fired
pub fn pending() -> usize {
    TIMER.get().map_or(0, |t| t.lock().heap.len())
}

fn timer_loop() {
    // The spawning thread finishes initializing TIMER before we can see it
    let t = timer();
    kdebug!("timer thread running");

    let mut state = t.lock();
    loop {
        let now = Instant::now();
        let mut expired = Vec::new();
        while state.heap.peek().is_some_and(|head| head.deadline <= now) {
            if let Some(entry) = state.heap.pop() {
                expired.push(entry.job);
            }
        }

        if !expired.is_empty() {
            drop(state);
            for job in expired {
                run_job(job);
            }
            state = t.lock();
            continue;
        }

        let sleep = state
            .heap
            .peek()
            .map_or(t.max_poll, |head| (head.deadline - now).min(t.max_poll));
        state = t
            .cond
            .wait_timeout(state, sleep)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}
