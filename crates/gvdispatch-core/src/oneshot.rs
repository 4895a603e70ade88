//! Single-value completion cell
//!
//! A `Promise` is fulfilled at most once; its `Completion` can be waited on
//! from a plain thread (`wait`, `wait_timeout`) or awaited as a `Future`.
//! Callback-style operations use it to offer a future-shaped API with the
//! same exactly-once guarantee.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Create a connected promise/completion pair
pub fn oneshot<T>() -> (Promise<T>, Completion<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            value: None,
            waker: None,
            abandoned: false,
        }),
        cond: Condvar::new(),
    });

    (
        Promise { inner: Some(Arc::clone(&inner)) },
        Completion { inner },
    )
}

/// Writing half
pub struct Promise<T> {
    inner: Option<Arc<Inner<T>>>,
}

/// Reading half
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

struct State<T> {
    value: Option<T>,
    waker: Option<Waker>,
    /// Promise dropped without a value
    abandoned: bool,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Promise<T> {
    /// Fulfil the promise, waking any waiter
    pub fn complete(mut self, value: T) {
        if let Some(inner) = self.inner.take() {
            let waker = {
                let mut state = inner.lock();
                state.value = Some(value);
                state.waker.take()
            };
            inner.cond.notify_all();
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let waker = {
                let mut state = inner.lock();
                state.abandoned = true;
                state.waker.take()
            };
            inner.cond.notify_all();
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

impl<T> Completion<T> {
    /// Block until the value arrives.
    ///
    /// Returns `None` if the promise was dropped unfulfilled.
    pub fn wait(self) -> Option<T> {
        let mut state = self.inner.lock();
        loop {
            if let Some(v) = state.value.take() {
                return Some(v);
            }
            if state.abandoned {
                return None;
            }
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the value arrives or `timeout` elapses.
    ///
    /// On timeout the completion is handed back so the caller can retry.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Option<T>, Completion<T>> {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.inner.lock();
            loop {
                if let Some(v) = state.value.take() {
                    return Ok(Some(v));
                }
                if state.abandoned {
                    return Ok(None);
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                state = self
                    .inner
                    .cond
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
        Err(self)
    }

    /// Check without blocking
    pub fn is_ready(&self) -> bool {
        let state = self.inner.lock();
        state.value.is_some() || state.abandoned
    }
}

impl<T> Future for Completion<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.lock();
        if let Some(v) = state.value.take() {
            return Poll::Ready(Some(v));
        }
        if state.abandoned {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("ready", &self.is_ready())
            .finish()
    }
}
