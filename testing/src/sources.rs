//! Sources a test drives by hand.

use conflux_core::{BoxError, Readiness, Source};
use futures::task::AtomicWaker;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
    failure: Option<BoxError>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    waker: AtomicWaker,
}

impl<T> Inner<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A source whose readiness is controlled through a [`ManualHandle`].
///
/// Queued values are yielded first; a pending failure or closure takes effect
/// once the queue is drained.
///
/// # Example
///
/// ```
/// use conflux_testing::ManualSource;
///
/// let (source, handle) = ManualSource::new();
/// handle.push("hello");
/// assert_eq!(handle.queued(), 1);
/// # drop(source);
/// ```
pub struct ManualSource<T> {
    inner: Arc<Inner<T>>,
    exhausted: bool,
}

/// Producer side of a [`ManualSource`].
pub struct ManualHandle<T> {
    inner: Arc<Inner<T>>,
}

impl<T> ManualSource<T> {
    /// Create a source and the handle that feeds it.
    #[must_use]
    pub fn new() -> (Self, ManualHandle<T>) {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                closed: false,
                failure: None,
            }),
            waker: AtomicWaker::new(),
        });

        (
            Self {
                inner: Arc::clone(&inner),
                exhausted: false,
            },
            ManualHandle { inner },
        )
    }
}

impl<T> Source for ManualSource<T>
where
    T: Send + 'static,
{
    type Item = T;

    fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Readiness<T>> {
        if self.exhausted {
            return Poll::Ready(Readiness::Closed);
        }

        self.inner.waker.register(cx.waker());
        let mut state = self.inner.state();

        if let Some(value) = state.queue.pop_front() {
            return Poll::Ready(Readiness::Value(value));
        }
        if let Some(error) = state.failure.take() {
            self.exhausted = true;
            return Poll::Ready(Readiness::Failed(error));
        }
        if state.closed {
            self.exhausted = true;
            return Poll::Ready(Readiness::Closed);
        }
        Poll::Pending
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl<T> fmt::Debug for ManualSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualSource")
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl<T> ManualHandle<T> {
    /// Queue a value and wake the waiting round.
    pub fn push(&self, value: T) {
        self.inner.state().queue.push_back(value);
        self.inner.waker.wake();
    }

    /// Close the source once its queue drains.
    pub fn close(&self) {
        self.inner.state().closed = true;
        self.inner.waker.wake();
    }

    /// Fail the source once its queue drains.
    pub fn fail(&self, error: impl Into<BoxError>) {
        self.inner.state().failure = Some(error.into());
        self.inner.waker.wake();
    }

    /// Values pushed but not yet taken.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.state().queue.len()
    }
}

impl<T> Clone for ManualHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ManualHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualHandle").finish_non_exhaustive()
    }
}

/// A source that is ready on every poll, yielding clones of one value.
///
/// Useful for fairness tests: two of these never leave the multiplexer idle.
#[derive(Debug)]
pub struct AlwaysReady<T> {
    value: T,
    taken: Arc<AtomicUsize>,
}

impl<T: Clone> AlwaysReady<T> {
    /// Create a source that always yields `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            value,
            taken: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of values taken so far.
    #[must_use]
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.taken)
    }
}

impl<T> Source for AlwaysReady<T>
where
    T: Clone + Send + 'static,
{
    type Item = T;

    fn poll_take(&mut self, _cx: &mut Context<'_>) -> Poll<Readiness<T>> {
        self.taken.fetch_add(1, Ordering::Relaxed);
        Poll::Ready(Readiness::Value(self.value.clone()))
    }
}
