//! Event sources for fan-in consumption.
//!
//! A [`Source`] is anything a multiplexer can wait on. Each poll reports one
//! of three states:
//!
//! | Poll result | Meaning |
//! |---|---|
//! | `Poll::Pending` | blocked; the waker in `cx` is registered for readiness |
//! | `Poll::Ready(Readiness::Value(v))` | ready; `v` has been taken out of the source |
//! | `Poll::Ready(Readiness::Closed)` | permanently exhausted |
//! | `Poll::Ready(Readiness::Failed(e))` | exhausted because the producer failed |
//!
//! The multiplexer owns its sources but not whatever backs them (sockets,
//! timers, spawned producers); their lifecycle stays with the caller.
//!
//! # Adapters
//!
//! - [`once`] / [`try_once`]: single-value producers backed by a future
//! - [`from_oneshot`]: a `tokio::sync::oneshot` receiver
//! - [`from_stream`] / [`try_from_stream`]: any `futures::Stream`
//! - [`from_receiver`] / [`from_unbounded`]: `tokio::sync::mpsc` receivers
//! - [`pending`]: a source that is never ready
//!
//! # Example
//!
//! ```
//! use conflux_core::source::{self, Readiness, Source};
//! use std::task::Poll;
//!
//! let mut chan1 = source::once(async { 10 });
//! let waker = futures::task::noop_waker();
//! let mut cx = std::task::Context::from_waker(&waker);
//!
//! assert!(matches!(chan1.poll_take(&mut cx), Poll::Ready(Readiness::Value(10))));
//! assert!(chan1.is_exhausted());
//! ```

use crate::error::BoxError;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

/// Outcome of a successful poll on a [`Source`].
pub enum Readiness<T> {
    /// A value was taken from the source
    Value(T),
    /// The source is permanently exhausted
    Closed,
    /// The producer failed; the source is exhausted from now on
    Failed(BoxError),
}

impl<T> Readiness<T> {
    /// Transform the carried value, leaving `Closed` and `Failed` untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Readiness<U> {
        match self {
            Self::Value(value) => Readiness::Value(f(value)),
            Self::Closed => Readiness::Closed,
            Self::Failed(error) => Readiness::Failed(error),
        }
    }

    /// Whether this is a `Value`.
    #[must_use]
    pub const fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }
}

impl<T: fmt::Debug> fmt::Debug for Readiness<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Readiness::Value").field(value).finish(),
            Self::Closed => write!(f, "Readiness::Closed"),
            Self::Failed(error) => write!(f, "Readiness::Failed({error})"),
        }
    }
}

/// A labeled producer of values consumed by a fan-in multiplexer.
///
/// Implementations must register `cx`'s waker whenever they return
/// `Poll::Pending`, exactly like `Future::poll`. A value is considered
/// consumed as soon as it is returned in `Readiness::Value`.
pub trait Source: Send {
    /// The type of value this source produces
    type Item: Send + 'static;

    /// Try to take the next value, registering for wake-up if none is ready.
    fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Readiness<Self::Item>>;

    /// Whether the source already knows it will never produce again.
    ///
    /// One-shot sources report `true` right after their value is taken, so
    /// the multiplexer can report exhaustion in the same dispatch round.
    /// Streams usually only learn this on their next poll and may keep the
    /// default.
    fn is_exhausted(&self) -> bool {
        false
    }
}

impl<S> Source for Box<S>
where
    S: Source + ?Sized,
{
    type Item = S::Item;

    fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Readiness<Self::Item>> {
        (**self).poll_take(cx)
    }

    fn is_exhausted(&self) -> bool {
        (**self).is_exhausted()
    }
}

/// One-shot source backed by an infallible future.
///
/// Created by [`once`].
pub struct Once<F> {
    future: Option<Pin<Box<F>>>,
}

/// Create a one-shot source that yields the output of `future` once.
pub fn once<F>(future: F) -> Once<F>
where
    F: Future + Send,
    F::Output: Send + 'static,
{
    Once {
        future: Some(Box::pin(future)),
    }
}

impl<F> Source for Once<F>
where
    F: Future + Send,
    F::Output: Send + 'static,
{
    type Item = F::Output;

    fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Readiness<Self::Item>> {
        let Some(future) = self.future.as_mut() else {
            return Poll::Ready(Readiness::Closed);
        };

        match future.as_mut().poll(cx) {
            Poll::Ready(value) => {
                self.future = None;
                Poll::Ready(Readiness::Value(value))
            },
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.future.is_none()
    }
}

impl<F> fmt::Debug for Once<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Once")
            .field("exhausted", &self.future.is_none())
            .finish()
    }
}

/// One-shot source backed by a fallible future.
///
/// Created by [`try_once`] and [`from_oneshot`].
pub struct TryOnce<F> {
    future: Option<Pin<Box<F>>>,
}

/// Create a one-shot source from a future that may fail.
///
/// `Ok(v)` is delivered as a value; `Err(e)` exhausts the source with an error.
pub fn try_once<F, T, E>(future: F) -> TryOnce<F>
where
    F: Future<Output = Result<T, E>> + Send,
    T: Send + 'static,
    E: Into<BoxError>,
{
    TryOnce {
        future: Some(Box::pin(future)),
    }
}

impl<F, T, E> Source for TryOnce<F>
where
    F: Future<Output = Result<T, E>> + Send,
    T: Send + 'static,
    E: Into<BoxError>,
{
    type Item = T;

    fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Readiness<Self::Item>> {
        let Some(future) = self.future.as_mut() else {
            return Poll::Ready(Readiness::Closed);
        };

        match future.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.future = None;
                Poll::Ready(match result {
                    Ok(value) => Readiness::Value(value),
                    Err(error) => Readiness::Failed(error.into()),
                })
            },
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.future.is_none()
    }
}

impl<F> fmt::Debug for TryOnce<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TryOnce")
            .field("exhausted", &self.future.is_none())
            .finish()
    }
}

/// Create a one-shot source from a `oneshot` receiver.
///
/// If the sender is dropped without sending, the source fails with the
/// receiver's `RecvError`.
pub fn from_oneshot<T>(rx: oneshot::Receiver<T>) -> TryOnce<oneshot::Receiver<T>>
where
    T: Send + 'static,
{
    try_once(rx)
}

/// Multi-value source backed by a `Stream`.
///
/// Created by [`from_stream`].
pub struct StreamSource<S> {
    stream: Pin<Box<S>>,
    done: bool,
}

/// Create a source that yields every item of `stream`, then closes.
pub fn from_stream<S>(stream: S) -> StreamSource<S>
where
    S: Stream + Send,
    S::Item: Send + 'static,
{
    StreamSource {
        stream: Box::pin(stream),
        done: false,
    }
}

impl<S> Source for StreamSource<S>
where
    S: Stream + Send,
    S::Item: Send + 'static,
{
    type Item = S::Item;

    fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Readiness<Self::Item>> {
        if self.done {
            return Poll::Ready(Readiness::Closed);
        }

        match self.stream.as_mut().poll_next(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Readiness::Value(item)),
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Readiness::Closed)
            },
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.done
    }
}

impl<S> fmt::Debug for StreamSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSource")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Multi-value source backed by a stream of `Result`s.
///
/// The first `Err` exhausts the source. Created by [`try_from_stream`].
pub struct TryStreamSource<S> {
    stream: Pin<Box<S>>,
    done: bool,
}

/// Create a source from a fallible stream.
pub fn try_from_stream<S, T, E>(stream: S) -> TryStreamSource<S>
where
    S: Stream<Item = Result<T, E>> + Send,
    T: Send + 'static,
    E: Into<BoxError>,
{
    TryStreamSource {
        stream: Box::pin(stream),
        done: false,
    }
}

impl<S, T, E> Source for TryStreamSource<S>
where
    S: Stream<Item = Result<T, E>> + Send,
    T: Send + 'static,
    E: Into<BoxError>,
{
    type Item = T;

    fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Readiness<Self::Item>> {
        if self.done {
            return Poll::Ready(Readiness::Closed);
        }

        match self.stream.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Readiness::Value(item)),
            Poll::Ready(Some(Err(error))) => {
                self.done = true;
                Poll::Ready(Readiness::Failed(error.into()))
            },
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Readiness::Closed)
            },
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.done
    }
}

impl<S> fmt::Debug for TryStreamSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TryStreamSource")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

enum Channel<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

/// Multi-value source backed by a `tokio::sync::mpsc` receiver.
///
/// Closes once every sender has been dropped and the buffer is drained.
/// Created by [`from_receiver`] and [`from_unbounded`].
pub struct ReceiverSource<T> {
    channel: Channel<T>,
    done: bool,
}

/// Create a source from a bounded `mpsc` receiver.
#[must_use]
pub const fn from_receiver<T>(rx: mpsc::Receiver<T>) -> ReceiverSource<T> {
    ReceiverSource {
        channel: Channel::Bounded(rx),
        done: false,
    }
}

/// Create a source from an unbounded `mpsc` receiver.
#[must_use]
pub const fn from_unbounded<T>(rx: mpsc::UnboundedReceiver<T>) -> ReceiverSource<T> {
    ReceiverSource {
        channel: Channel::Unbounded(rx),
        done: false,
    }
}

impl<T> Source for ReceiverSource<T>
where
    T: Send + 'static,
{
    type Item = T;

    fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Readiness<Self::Item>> {
        if self.done {
            return Poll::Ready(Readiness::Closed);
        }

        let polled = match &mut self.channel {
            Channel::Bounded(rx) => rx.poll_recv(cx),
            Channel::Unbounded(rx) => rx.poll_recv(cx),
        };

        match polled {
            Poll::Ready(Some(value)) => Poll::Ready(Readiness::Value(value)),
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Readiness::Closed)
            },
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.done
    }
}

impl<T> fmt::Debug for ReceiverSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.channel {
            Channel::Bounded(_) => "bounded",
            Channel::Unbounded(_) => "unbounded",
        };
        f.debug_struct("ReceiverSource")
            .field("kind", &kind)
            .field("done", &self.done)
            .finish()
    }
}

/// Source that is never ready and never exhausted.
///
/// Created by [`pending`].
pub struct Pending<T> {
    _item: PhantomData<fn() -> T>,
}

/// Create a source that never produces a value.
#[must_use]
pub const fn pending<T>() -> Pending<T> {
    Pending { _item: PhantomData }
}

impl<T> Source for Pending<T>
where
    T: Send + 'static,
{
    type Item = T;

    fn poll_take(&mut self, _cx: &mut Context<'_>) -> Poll<Readiness<Self::Item>> {
        Poll::Pending
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pending")
    }
}
