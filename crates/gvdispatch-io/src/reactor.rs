//! # Reactor - the readiness poller behind every channel
//!
//! The reactor runs on a dedicated OS thread ("gvd-reactor"). It:
//! 1. Collects every registered source that still has pending operations
//! 2. Waits in `poll(2)` on those descriptors plus its eventfd
//! 3. Hands each ready source its `revents` so the source can issue the
//!    non-blocking syscalls itself
//!
//! Sources register when an operation is submitted and are dropped from the
//! active set once they report no interest (idle or closed). Registration and
//! close both poke the eventfd so the poll set is rebuilt promptly.
//!
//! Besides channels, [`when_readable`] offers a one-shot readiness watch,
//! which is how accept loops wait for connections without holding a worker.

use crate::config::ReactorConfig;
use crate::sys;
use crate::waker::EventFdWaker;

use gvdispatch_core::{kdebug, kerror, ktrace, IoError};
use gvdispatch_runtime::Queue;
use nix::errno::Errno;

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique key for a source in the active set
pub(crate) fn next_source_id() -> u64 {
    NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Something the reactor can poll on behalf of
pub(crate) trait Source: Send + Sync {
    fn fd(&self) -> RawFd;

    /// `poll` events wanted right now; 0 removes the source from the set
    fn interest(&self) -> libc::c_short;

    /// Called on the reactor thread with the returned events
    fn on_ready(&self, revents: libc::c_short, config: &ReactorConfig);
}

pub(crate) struct Reactor {
    waker: EventFdWaker,
    active: Mutex<HashMap<u64, Arc<dyn Source>>>,
    config: ReactorConfig,
}

static REACTOR: OnceLock<Result<Reactor, IoError>> = OnceLock::new();

/// The process-wide reactor, started on first use
pub(crate) fn reactor() -> Result<&'static Reactor, IoError> {
    REACTOR
        .get_or_init(|| {
            let waker = EventFdWaker::create().map_err(IoError::from)?;
            let config = ReactorConfig::from_env();
            let config = match config.validate() {
                Ok(()) => config,
                Err(e) => {
                    kerror!("ignoring reactor config from environment: {}", e);
                    ReactorConfig::new()
                }
            };
            thread::Builder::new()
                .name("gvd-reactor".into())
                .spawn(reactor_thread)
                .map_err(|e| {
                    kerror!("failed to spawn reactor thread: {}", e);
                    IoError::from(e)
                })?;
            Ok(Reactor {
                waker,
                active: Mutex::new(HashMap::new()),
                config,
            })
        })
        .as_ref()
        .map_err(|e| *e)
}

/// Number of sources in the active set (0 if the reactor never started)
pub fn active_sources() -> usize {
    match REACTOR.get() {
        Some(Ok(r)) => r.lock().len(),
        _ => 0,
    }
}

impl Reactor {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<dyn Source>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `source` to the poll set (no-op if present) and wake the reactor.
    ///
    /// Callers make the new work visible in the source before registering.
    pub(crate) fn register(&self, id: u64, source: Arc<dyn Source>) {
        self.lock().entry(id).or_insert(source);
        self.waker.wake();
    }

    /// Make the reactor rebuild its poll set
    pub(crate) fn wake(&self) {
        self.waker.wake();
    }

    fn run(&self) {
        kdebug!("reactor running, poll timeout {:?}", self.config.poll_timeout);
        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut sources: Vec<Arc<dyn Source>> = Vec::new();

        loop {
            fds.clear();
            sources.clear();
            fds.push(libc::pollfd {
                fd: self.waker.fd(),
                events: libc::POLLIN,
                revents: 0,
            });

            // Interest is evaluated under the set lock, so a source whose
            // work arrives concurrently is either seen here or re-inserted
            // by its own `register` call afterwards.
            self.lock().retain(|_, source| {
                let events = source.interest();
                if events == 0 {
                    return false;
                }
                fds.push(libc::pollfd {
                    fd: source.fd(),
                    events,
                    revents: 0,
                });
                sources.push(Arc::clone(source));
                true
            });

            match sys::poll(&mut fds, self.config.poll_timeout_ms()) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    kerror!("poll failed: {}", e);
                    thread::sleep(self.config.poll_timeout);
                    continue;
                }
            }

            if fds[0].revents != 0 {
                self.waker.drain();
            }
            for (pfd, source) in fds[1..].iter().zip(&sources) {
                if pfd.revents != 0 {
                    ktrace!("fd {} ready: {:#x}", pfd.fd, pfd.revents);
                    source.on_ready(pfd.revents, &self.config);
                }
            }
        }
    }
}

type ReadyTask = Box<dyn FnOnce(libc::c_short) + Send + 'static>;

/// One-shot readability watch
struct Watch {
    fd: RawFd,
    queue: Queue,
    task: Mutex<Option<ReadyTask>>,
}

impl Source for Watch {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> libc::c_short {
        let armed = self.task.lock().unwrap_or_else(PoisonError::into_inner).is_some();
        if armed {
            libc::POLLIN
        } else {
            0
        }
    }

    fn on_ready(&self, revents: libc::c_short, _config: &ReactorConfig) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            self.queue.async_exec(move || task(revents));
        }
    }
}

/// Run `f` on `queue` once `fd` is readable (or hung up, or invalid).
///
/// `f` receives the `poll` events. The watch fires once; re-arm it from `f`
/// to keep waiting.
pub fn when_readable<F>(fd: RawFd, queue: &Queue, f: F) -> Result<(), IoError>
where
    F: FnOnce(libc::c_short) + Send + 'static,
{
    let watch = Arc::new(Watch {
        fd,
        queue: queue.clone(),
        task: Mutex::new(Some(Box::new(f))),
    });
    reactor()?.register(next_source_id(), watch);
    Ok(())
}

fn reactor_thread() {
    // Blocks until the spawning thread finishes initializing REACTOR
    if let Ok(r) = reactor() {
        r.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gvdispatch_core::{oneshot, Promise};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    struct OneShotSource {
        stream: UnixStream,
        ready: Mutex<Option<Promise<libc::c_short>>>,
    }

    impl Source for OneShotSource {
        fn fd(&self) -> RawFd {
            self.stream.as_raw_fd()
        }

        fn interest(&self) -> libc::c_short {
            let pending = self.ready.lock().unwrap().is_some();
            if pending {
                libc::POLLIN
            } else {
                0
            }
        }

        fn on_ready(&self, revents: libc::c_short, _config: &ReactorConfig) {
            if let Some(p) = self.ready.lock().unwrap().take() {
                p.complete(revents);
            }
        }
    }

    #[test]
    fn test_when_readable_fires_once() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let queue = gvdispatch_runtime::default_queue();
        let (tx, rx) = oneshot();
        when_readable(a.as_raw_fd(), &queue, move |revents| tx.complete(revents)).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(!rx.is_ready());
        std::io::Write::write_all(&mut b, b"go").unwrap();
        let revents = rx.wait_timeout(Duration::from_secs(5)).ok().flatten();
        assert!(revents.is_some_and(|ev| ev & libc::POLLIN != 0));
        drop(a);
    }

    #[test]
    fn test_register_and_dispatch() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let (tx, rx) = oneshot();
        let source = Arc::new(OneShotSource {
            stream: a,
            ready: Mutex::new(Some(tx)),
        });
        let r = reactor().unwrap();
        r.register(next_source_id(), source);

        std::io::Write::write_all(&mut b, b"x").unwrap();
        let revents = rx.wait_timeout(Duration::from_secs(5)).ok().flatten();
        assert!(revents.is_some_and(|ev| ev & libc::POLLIN != 0));
    }
}
