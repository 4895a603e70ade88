//! Asynchronous I/O channel
//!
//! An [`IoChannel`] owns the I/O state of exactly one descriptor. Reads and
//! writes are queued per direction and driven by the reactor with
//! non-blocking syscalls; every operation reports through a handler that may
//! be called several times:
//!
//! - reads deliver `Success { done: false }` whenever at least `low_water`
//!   bytes are buffered, never more than `high_water` bytes at a time, and
//!   `Success { done: true }` at end of stream or once `length` is read;
//! - writes issue syscalls of at most `high_water` bytes, report the
//!   remaining bytes after every `low_water` written, and finish with
//!   `Success { done: true }`;
//! - `close()` turns every outstanding operation into `Canceled`, a
//!   descriptor error turns every one into `Failure`.
//!
//! Deliveries of one operation run one at a time and in order on the queue
//! given with the operation, even if that queue is concurrent. The cleanup
//! handler runs once on the channel's queue after the last outstanding
//! operation has received its terminal outcome.

use crate::config::ReactorConfig;
use crate::reactor::{next_source_id, reactor, Source};
use crate::sys;

use gvdispatch_core::constants::{MAX_IO_CHUNK, READ_TO_END, WATER_UNLIMITED};
use gvdispatch_core::{kerror, kwarn, ChannelKind, CleanupOutcome, IoError, IoOutcome};
use gvdispatch_runtime::Queue;
use nix::errno::Errno;

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Handler = Box<dyn FnMut(IoOutcome) + Send + 'static>;
type Cleanup = Box<dyn FnOnce(CleanupOutcome) + Send + 'static>;

/// Handle to an I/O channel. Clones share the channel.
#[derive(Clone)]
pub struct IoChannel {
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    id: u64,
    fd: RawFd,
    kind: ChannelKind,
    socket: bool,
    queue: Queue,
    state: Mutex<ChannelState>,
}

struct ChannelState {
    low_water: usize,
    high_water: usize,
    reads: VecDeque<ReadOp>,
    writes: VecDeque<WriteOp>,
    closed: bool,
    /// First descriptor error, reported to cleanup
    error: Option<IoError>,
    /// Operations whose terminal outcome has not been handled yet
    outstanding: usize,
    cleanup: Option<Cleanup>,
}

struct ReadOp {
    offset: i64,
    /// Bytes still wanted, `None` = until end of stream
    limit: Option<usize>,
    /// Complete with the first non-empty read
    chunk: bool,
    progress: usize,
    buffered: Vec<u8>,
    low: usize,
    high: usize,
    delivery: Arc<Delivery>,
}

struct WriteOp {
    offset: i64,
    data: Vec<u8>,
    written: usize,
    since_report: usize,
    low: usize,
    high: usize,
    delivery: Arc<Delivery>,
}

/// What the reactor does next with the front operation
enum Step {
    /// Keep issuing syscalls for the same operation
    More,
    /// Operation finished; pop it and move on
    Finished,
    /// Would block
    Blocked,
}

impl IoChannel {
    /// Wrap `fd`. The channel does not own the descriptor: `cleanup` runs on
    /// `queue` once the channel is fully closed and is where the owner
    /// releases it.
    pub fn new<C>(kind: ChannelKind, fd: RawFd, queue: Queue, cleanup: C) -> IoChannel
    where
        C: FnOnce(CleanupOutcome) + Send + 'static,
    {
        if let Err(e) = sys::set_nonblocking(fd) {
            kwarn!("fd {}: cannot set O_NONBLOCK: {}", fd, e);
        }
        IoChannel {
            shared: Arc::new(ChannelShared {
                id: next_source_id(),
                fd,
                kind,
                socket: sys::is_socket(fd),
                queue,
                state: Mutex::new(ChannelState {
                    low_water: WATER_UNLIMITED,
                    high_water: WATER_UNLIMITED,
                    reads: VecDeque::new(),
                    writes: VecDeque::new(),
                    closed: false,
                    error: None,
                    outstanding: 0,
                    cleanup: Some(Box::new(cleanup)),
                }),
            }),
        }
    }

    /// Read up to `length` bytes (`READ_TO_END` for no limit) starting at
    /// `offset`, which is ignored by stream channels
    pub fn read<H>(&self, offset: i64, length: usize, queue: &Queue, handler: H)
    where
        H: FnMut(IoOutcome) + Send + 'static,
    {
        let limit = (length != READ_TO_END).then_some(length);
        self.submit_read(offset, limit, false, queue, Box::new(handler));
    }

    /// Read whatever arrives next, at most `max` bytes.
    ///
    /// Completes (`done == true`) with the first non-empty chunk, or with
    /// empty data at end of stream.
    pub fn read_chunk<H>(&self, max: usize, queue: &Queue, handler: H)
    where
        H: FnMut(IoOutcome) + Send + 'static,
    {
        self.submit_read(0, Some(max.max(1)), true, queue, Box::new(handler));
    }

    /// Write all of `data` at `offset` (ignored by stream channels)
    pub fn write<H>(&self, offset: i64, queue: &Queue, data: Vec<u8>, handler: H)
    where
        H: FnMut(IoOutcome) + Send + 'static,
    {
        let delivery = Delivery::new(queue.clone(), Box::new(handler), &self.shared);
        let (rejected, start_now) = {
            let mut st = self.shared.lock();
            st.outstanding += 1;
            if st.closed {
                (Some(IoOutcome::Canceled { data }), false)
            } else if data.is_empty() && st.writes.is_empty() {
                (Some(IoOutcome::Success { done: true, data }), false)
            } else {
                let op = WriteOp {
                    offset,
                    data,
                    written: 0,
                    since_report: 0,
                    low: st.low_water,
                    high: st.high_water,
                    delivery: Arc::clone(&delivery),
                };
                st.writes.push_back(op);
                (None, true)
            }
        };
        if let Some(outcome) = rejected {
            delivery.push(outcome);
        }
        if start_now {
            self.register();
        }
    }

    fn submit_read(
        &self,
        offset: i64,
        limit: Option<usize>,
        chunk: bool,
        queue: &Queue,
        handler: Handler,
    ) {
        let delivery = Delivery::new(queue.clone(), handler, &self.shared);
        let (rejected, start_now) = {
            let mut st = self.shared.lock();
            st.outstanding += 1;
            if st.closed {
                (Some(IoOutcome::Canceled { data: Vec::new() }), false)
            } else if limit == Some(0) && st.reads.is_empty() {
                (Some(IoOutcome::Success { done: true, data: Vec::new() }), false)
            } else {
                let op = ReadOp {
                    offset,
                    limit,
                    chunk,
                    progress: 0,
                    buffered: Vec::new(),
                    low: st.low_water,
                    high: st.high_water,
                    delivery: Arc::clone(&delivery),
                };
                st.reads.push_back(op);
                (None, true)
            }
        };
        if let Some(outcome) = rejected {
            delivery.push(outcome);
        }
        if start_now {
            self.register();
        }
    }

    fn register(&self) {
        match reactor() {
            Ok(r) => r.register(self.shared.id, Arc::clone(&self.shared) as Arc<dyn Source>),
            Err(e) => {
                kerror!("fd {}: reactor unavailable: {}", self.shared.fd, e);
                self.shared.fail(e);
            }
        }
    }

    /// Minimum bytes per partial delivery, for operations submitted later
    pub fn set_low_water(&self, bytes: usize) {
        self.shared.lock().low_water = bytes;
    }

    /// Maximum bytes per delivery or per write syscall, for operations
    /// submitted later. Zero is treated as 1.
    pub fn set_high_water(&self, bytes: usize) {
        self.shared.lock().high_water = bytes.max(1);
    }

    /// Cancel outstanding operations and release the channel.
    ///
    /// Idempotent. Cleanup runs once every canceled operation's handler has
    /// seen its `Canceled` outcome.
    pub fn close(&self) {
        let cleanup = {
            let mut st = self.shared.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            for op in st.reads.drain(..) {
                op.delivery.push(IoOutcome::Canceled { data: op.buffered });
            }
            for op in st.writes.drain(..) {
                let mut data = op.data;
                data.drain(..op.written);
                op.delivery.push(IoOutcome::Canceled { data });
            }
            st.take_cleanup()
        };
        self.shared.run_cleanup(cleanup);
        if let Ok(r) = reactor() {
            r.wake();
        }
    }

    /// The wrapped descriptor, valid until cleanup has run
    pub fn file_descriptor(&self) -> RawFd {
        self.shared.fd
    }

    pub fn kind(&self) -> ChannelKind {
        self.shared.kind
    }

    /// Queue the cleanup handler runs on
    pub fn queue(&self) -> &Queue {
        &self.shared.queue
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl std::fmt::Debug for IoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoChannel")
            .field("fd", &self.shared.fd)
            .field("kind", &self.shared.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelState {
    fn take_cleanup(&mut self) -> Option<(Cleanup, CleanupOutcome)> {
        if self.closed && self.outstanding == 0 {
            let outcome = CleanupOutcome::from_error(self.error);
            self.cleanup.take().map(|c| (c, outcome))
        } else {
            None
        }
    }
}

impl ChannelShared {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_cleanup(&self, cleanup: Option<(Cleanup, CleanupOutcome)>) {
        if let Some((cleanup, outcome)) = cleanup {
            self.queue.async_exec(move || cleanup(outcome));
        }
    }

    /// A handler received its terminal outcome
    fn operation_finished(&self) {
        let cleanup = {
            let mut st = self.lock();
            st.outstanding = st.outstanding.saturating_sub(1);
            st.take_cleanup()
        };
        self.run_cleanup(cleanup);
    }

    /// Tear the channel down after a descriptor error
    fn fail(&self, err: IoError) {
        let cleanup = {
            let mut st = self.lock();
            Self::fail_locked(&mut st, err)
        };
        self.run_cleanup(cleanup);
    }

    fn fail_locked(st: &mut ChannelState, err: IoError) -> Option<(Cleanup, CleanupOutcome)> {
        if st.error.is_none() {
            st.error = Some(err);
        }
        st.closed = true;
        for op in st.reads.drain(..) {
            op.delivery.push(IoOutcome::Failure(err));
        }
        for op in st.writes.drain(..) {
            op.delivery.push(IoOutcome::Failure(err));
        }
        st.take_cleanup()
    }

    fn pump_reads(&self, st: &mut ChannelState, budget: usize) -> Result<(), Errno> {
        let mut budget = budget;
        while let Some(op) = st.reads.front_mut() {
            let step = if op.limit == Some(0) {
                Step::Finished
            } else if budget == 0 {
                return Ok(());
            } else {
                budget -= 1;
                self.read_once(op)?
            };

            match step {
                Step::More => {}
                Step::Blocked => return Ok(()),
                Step::Finished => {
                    if let Some(op) = st.reads.pop_front() {
                        op.delivery.push(IoOutcome::Success {
                            done: true,
                            data: op.buffered,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn read_once(&self, op: &mut ReadOp) -> Result<Step, Errno> {
        let want = op
            .limit
            .unwrap_or(usize::MAX)
            .min(op.high.saturating_sub(op.buffered.len()).max(1))
            .min(MAX_IO_CHUNK);
        let offset = match self.kind {
            ChannelKind::RandomAccess => Some(offset_at(op.offset, op.progress)?),
            ChannelKind::Stream => None,
        };

        let start = op.buffered.len();
        op.buffered.resize(start + want, 0);
        let result = sys::read_at(self.fd, &mut op.buffered[start..], offset);
        op.buffered.truncate(start + *result.as_ref().unwrap_or(&0));
        let n = match result {
            Ok(n) => n,
            Err(Errno::EAGAIN) => return Ok(Step::Blocked),
            Err(Errno::EINTR) => return Ok(Step::More),
            Err(e) => return Err(e),
        };

        if n == 0 {
            return Ok(Step::Finished);
        }
        op.progress += n;
        if let Some(limit) = op.limit.as_mut() {
            *limit -= n;
        }
        if op.chunk || op.limit == Some(0) {
            return Ok(Step::Finished);
        }
        if op.buffered.len() >= op.low || op.buffered.len() >= op.high {
            let data = std::mem::take(&mut op.buffered);
            op.delivery.push(IoOutcome::Success { done: false, data });
        }
        Ok(Step::More)
    }

    fn pump_writes(&self, st: &mut ChannelState, budget: usize) -> Result<(), Errno> {
        let mut budget = budget;
        while let Some(op) = st.writes.front_mut() {
            let step = if op.written == op.data.len() {
                Step::Finished
            } else if budget == 0 {
                return Ok(());
            } else {
                budget -= 1;
                self.write_once(op)?
            };

            match step {
                Step::More => {}
                Step::Blocked => return Ok(()),
                Step::Finished => {
                    if let Some(op) = st.writes.pop_front() {
                        op.delivery.push(IoOutcome::Success {
                            done: true,
                            data: Vec::new(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn write_once(&self, op: &mut WriteOp) -> Result<Step, Errno> {
        let end = op.written + (op.data.len() - op.written).min(op.high);
        let offset = match self.kind {
            ChannelKind::RandomAccess => Some(offset_at(op.offset, op.written)?),
            ChannelKind::Stream => None,
        };

        let n = match sys::write_at(self.fd, &op.data[op.written..end], offset, self.socket) {
            Ok(0) | Err(Errno::EAGAIN) => return Ok(Step::Blocked),
            Err(Errno::EINTR) => return Ok(Step::More),
            Err(e) => return Err(e),
            Ok(n) => n,
        };
        op.written += n;
        op.since_report += n;

        if op.written == op.data.len() {
            return Ok(Step::Finished);
        }
        if op.since_report >= op.low || op.since_report >= op.high {
            op.since_report = 0;
            op.delivery.push(IoOutcome::Success {
                done: false,
                data: op.data[op.written..].to_vec(),
            });
        }
        Ok(Step::More)
    }
}

impl Source for ChannelShared {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> libc::c_short {
        let st = self.lock();
        if st.closed {
            return 0;
        }
        let mut events = 0;
        if !st.reads.is_empty() {
            events |= libc::POLLIN;
        }
        if !st.writes.is_empty() {
            events |= libc::POLLOUT;
        }
        events
    }

    fn on_ready(&self, revents: libc::c_short, config: &ReactorConfig) {
        let cleanup = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            if revents & libc::POLLNVAL != 0 {
                Self::fail_locked(&mut st, IoError::Os(Errno::EBADF))
            } else {
                let readable = revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
                let writable = revents & (libc::POLLOUT | libc::POLLHUP | libc::POLLERR) != 0;
                let mut result = Ok(());
                if readable && !st.reads.is_empty() {
                    result = self.pump_reads(&mut st, config.syscall_budget);
                }
                if result.is_ok() && writable && !st.writes.is_empty() {
                    result = self.pump_writes(&mut st, config.syscall_budget);
                }
                match result {
                    Ok(()) => None,
                    Err(e) => Self::fail_locked(&mut st, IoError::from(e)),
                }
            }
        };
        self.run_cleanup(cleanup);
    }
}

/// Ordered, non-overlapping delivery of one operation's outcomes
struct Delivery {
    queue: Queue,
    channel: Arc<ChannelShared>,
    state: Mutex<DeliveryState>,
}

struct DeliveryState {
    pending: VecDeque<IoOutcome>,
    /// A drain task is queued or running
    scheduled: bool,
    handler: Option<Handler>,
}

impl Delivery {
    fn new(queue: Queue, handler: Handler, channel: &Arc<ChannelShared>) -> Arc<Delivery> {
        Arc::new(Delivery {
            queue,
            channel: Arc::clone(channel),
            state: Mutex::new(DeliveryState {
                pending: VecDeque::new(),
                scheduled: false,
                handler: Some(handler),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(self: &Arc<Self>, outcome: IoOutcome) {
        let schedule = {
            let mut st = self.lock();
            st.pending.push_back(outcome);
            !std::mem::replace(&mut st.scheduled, true)
        };
        if schedule {
            let delivery = Arc::clone(self);
            self.queue.async_exec(move || delivery.drain());
        }
    }

    fn drain(&self) {
        loop {
            let (outcome, handler) = {
                let mut st = self.lock();
                match st.pending.pop_front() {
                    Some(outcome) => (outcome, st.handler.take()),
                    None => {
                        st.scheduled = false;
                        return;
                    }
                }
            };

            let terminal = outcome.is_terminal();
            if let Some(mut handler) = handler {
                match panic::catch_unwind(AssertUnwindSafe(|| handler(outcome))) {
                    Ok(()) if !terminal => self.lock().handler = Some(handler),
                    Ok(()) => {}
                    Err(_) => kerror!("fd {}: I/O handler panicked", self.channel.fd),
                }
            }
            if terminal {
                self.channel.operation_finished();
            }
        }
    }
}

/// File position `advanced` bytes past `base`
fn offset_at(base: i64, advanced: usize) -> Result<i64, Errno> {
    i64::try_from(advanced)
        .ok()
        .and_then(|n| base.checked_add(n))
        .ok_or(Errno::EOVERFLOW)
}
