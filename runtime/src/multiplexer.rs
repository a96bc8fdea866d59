//! Fan-in multiplexer.
//!
//! A [`FanInMultiplexer`] owns a fixed, ordered set of labeled sources and a
//! handler per source. Each dispatch round waits until at least one source is
//! ready, takes exactly one value and runs that source's handler before
//! returning.
//!
//! # Readiness
//!
//! Every active source is polled with the round's waker, so a round with
//! nothing ready parks until some producer wakes it. There is no polling
//! loop and no spurious return.
//!
//! # Fairness
//!
//! When several sources are ready at once, the round's scan order decides
//! which one wins. [`TieBreak::RoundRobin`] scans from one past the last
//! winner; [`TieBreak::Random`] scans in a freshly shuffled order, so every
//! ready source is equally likely to win regardless of its position or of
//! idle sources next to it. Neither starves a source that stays ready.
//!
//! # Cancellation is lossy
//!
//! A value is taken from its source only in the same step that dispatches it,
//! so cancelling a round never drops a taken value. Values still buffered
//! inside sources stay there; they are lost only if the multiplexer itself is
//! dropped.
//!
//! # Example
//!
//! ```rust
//! use conflux_core::source;
//! use conflux_runtime::{Budget, FanInMultiplexer};
//!
//! # async fn example() -> conflux_core::Result<()> {
//! let mut mux = FanInMultiplexer::builder()
//!     .channel("chan1", source::once(async { 10 }), |v: i32| {
//!         println!("Received data from chan1 {v}");
//!     })
//!     .channel("chan2", source::once(async { "P..." }), |v: &str| {
//!         println!("Received data from chan2 {v}");
//!     })
//!     .build()?;
//!
//! assert_eq!(mux.run(Budget::rounds(2)).await?, 2);
//! assert_eq!(mux.active_sources(), 0);
//! # Ok(())
//! # }
//! ```

use crate::metrics::MultiplexerMetrics;
use conflux_core::source::{Readiness, Source};
use conflux_core::{BoxError, Cancellation, ConfluxError, Label, Result};
use futures::future::poll_fn;
use rand::seq::SliceRandom;
use std::any::{Any, TypeId, type_name};
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Tie-break policy among simultaneously ready sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// Resume scanning one past the last source that fired
    #[default]
    RoundRobin,
    /// Scan the sources in a uniformly shuffled order each round
    Random,
}

/// Multiplexer configuration.
#[derive(Debug, Clone, Default)]
pub struct MultiplexerConfig {
    /// Selection policy among ready sources
    pub tie_break: TieBreak,
    /// Deadline used by [`FanInMultiplexer::run_once_bounded`]; `None` waits forever
    pub round_timeout: Option<Duration>,
}

impl MultiplexerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> MultiplexerConfigBuilder {
        MultiplexerConfigBuilder {
            tie_break: TieBreak::RoundRobin,
            round_timeout: None,
        }
    }
}

/// Builder for [`MultiplexerConfig`].
#[derive(Debug, Clone)]
pub struct MultiplexerConfigBuilder {
    tie_break: TieBreak,
    round_timeout: Option<Duration>,
}

impl MultiplexerConfigBuilder {
    /// Set the tie-break policy.
    #[must_use]
    pub const fn tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Bound how long [`FanInMultiplexer::run_once_bounded`] waits.
    #[must_use]
    pub const fn round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub const fn build(self) -> MultiplexerConfig {
        MultiplexerConfig {
            tie_break: self.tie_break,
            round_timeout: self.round_timeout,
        }
    }
}

/// How many rounds [`FanInMultiplexer::run`] may execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// At most this many rounds
    Rounds(usize),
    /// Until every source is exhausted
    UntilExhausted,
}

impl Budget {
    /// At most `n` rounds.
    #[must_use]
    pub const fn rounds(n: usize) -> Self {
        Self::Rounds(n)
    }

    const fn allows(self, executed: usize) -> bool {
        match self {
            Self::Rounds(limit) => executed < limit,
            Self::UntilExhausted => true,
        }
    }
}

/// What happened to the value of a dispatch round.
pub enum DispatchOutcome {
    /// A value was taken and its handler returned successfully
    Delivered,
    /// The source's producer failed instead of producing; the source is now exhausted
    SourceFailed(BoxError),
}

impl fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "Delivered"),
            Self::SourceFailed(error) => write!(f, "SourceFailed({error})"),
        }
    }
}

/// Result of one dispatch round.
#[derive(Debug)]
pub struct DispatchResult {
    /// Source that fired
    pub label: Label,
    /// What the round did with the source's output
    pub outcome: DispatchOutcome,
    /// Whether the source is exhausted after this round
    ///
    /// Only the firing source is reported here. A source that closes while a
    /// round is waiting is retired silently without producing a result; see
    /// [`FanInMultiplexer::is_exhausted`] and
    /// [`FanInMultiplexer::active_sources`] for those.
    pub exhausted: bool,
}

impl DispatchResult {
    /// Whether the round delivered a value to its handler.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self.outcome, DispatchOutcome::Delivered)
    }
}

/// Type-erased source: yields boxed values so heterogeneous sources can share
/// one readiness set.
trait ErasedSource: Send {
    fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Readiness<Box<dyn Any + Send>>>;
    fn is_exhausted(&self) -> bool;
    fn item_type(&self) -> (TypeId, &'static str);
}

struct SourceSlot<S>(S);

impl<S> ErasedSource for SourceSlot<S>
where
    S: Source,
{
    fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Readiness<Box<dyn Any + Send>>> {
        self.0
            .poll_take(cx)
            .map(|readiness| readiness.map(|value| Box::new(value) as Box<dyn Any + Send>))
    }

    fn is_exhausted(&self) -> bool {
        self.0.is_exhausted()
    }

    fn item_type(&self) -> (TypeId, &'static str) {
        (TypeId::of::<S::Item>(), type_name::<S::Item>())
    }
}

/// Type-erased handler: downcasts the boxed value back to its item type.
trait ErasedHandler: Send {
    fn call(&mut self, value: Box<dyn Any + Send>) -> std::result::Result<(), BoxError>;
    fn item_type(&self) -> (TypeId, &'static str);
}

struct HandlerSlot<T, H> {
    handler: H,
    _item: PhantomData<fn(T)>,
}

impl<T, H> ErasedHandler for HandlerSlot<T, H>
where
    T: 'static,
    H: FnMut(T) -> std::result::Result<(), BoxError> + Send,
{
    fn call(&mut self, value: Box<dyn Any + Send>) -> std::result::Result<(), BoxError> {
        match value.downcast::<T>() {
            Ok(value) => (self.handler)(*value),
            Err(_) => Err(format!("handler expected a value of type {}", type_name::<T>()).into()),
        }
    }

    fn item_type(&self) -> (TypeId, &'static str) {
        (TypeId::of::<T>(), type_name::<T>())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Active,
    Exhausted,
    Removed,
}

struct Channel {
    label: Label,
    source: Box<dyn ErasedSource>,
    handler: Box<dyn ErasedHandler>,
    state: ChannelState,
    deliveries: u64,
}

impl Channel {
    fn is_active(&self) -> bool {
        self.state == ChannelState::Active
    }

    fn mark_exhausted(&mut self) {
        if self.is_active() {
            self.state = ChannelState::Exhausted;
            MultiplexerMetrics::record_exhausted();
            tracing::debug!(source = %self.label, "Source exhausted");
        }
    }
}

/// What the readiness scan took out of a source.
enum Taken {
    Value(Box<dyn Any + Send>),
    Failed(BoxError),
}

/// Waits on a fixed set of labeled sources and dispatches one ready value per
/// round to that source's handler.
///
/// Handlers run synchronously inside the round. A handler must not wait on
/// the multiplexer that is running it.
pub struct FanInMultiplexer {
    channels: Vec<Channel>,
    config: MultiplexerConfig,
    cancellation: Cancellation,
    cursor: usize,
    rounds: usize,
}

impl FanInMultiplexer {
    /// Start building a multiplexer.
    #[must_use]
    pub fn builder() -> MultiplexerBuilder {
        MultiplexerBuilder::default()
    }

    /// Run exactly one dispatch round.
    ///
    /// Suspends until at least one active source is ready, takes one value,
    /// invokes its handler and returns. Sources that report closure during the
    /// wait are retired without consuming a round.
    ///
    /// Returns `Ok(None)` when no active source remains, including a
    /// multiplexer built with zero sources.
    ///
    /// # Errors
    ///
    /// - [`ConfluxError::Cancelled`] if cancellation interrupts the wait
    /// - [`ConfluxError::HandlerFailure`] if the handler fails; the round is
    ///   still complete and the value is not redelivered
    pub async fn run_once(&mut self) -> Result<Option<DispatchResult>> {
        let order = self.scan_order();
        let cancellation = self.cancellation.clone();
        let channels = &mut self.channels;

        let taken = tokio::select! {
            biased;

            () = cancellation.cancelled() => {
                tracing::debug!("Dispatch round cancelled");
                return Err(ConfluxError::Cancelled);
            }

            taken = poll_fn(|cx| poll_ready(channels, &order, cx)) => taken,
        };

        let Some((index, taken)) = taken else {
            tracing::debug!("All sources exhausted");
            return Ok(None);
        };

        self.cursor = index + 1;
        self.rounds += 1;
        self.dispatch(index, taken).map(Some)
    }

    /// [`run_once`](Self::run_once) with a deadline.
    ///
    /// Nothing is consumed when the deadline passes.
    ///
    /// # Errors
    ///
    /// [`ConfluxError::Timeout`] if no source becomes ready in time, plus
    /// everything [`run_once`](Self::run_once) returns.
    pub async fn run_once_timeout(&mut self, timeout: Duration) -> Result<Option<DispatchResult>> {
        tokio::time::timeout(timeout, self.run_once())
            .await
            .map_err(|_| ConfluxError::Timeout(timeout))?
    }

    /// [`run_once`](Self::run_once) bounded by the configured `round_timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`run_once_timeout`](Self::run_once_timeout).
    pub async fn run_once_bounded(&mut self) -> Result<Option<DispatchResult>> {
        match self.config.round_timeout {
            Some(timeout) => self.run_once_timeout(timeout).await,
            None => self.run_once().await,
        }
    }

    /// Run dispatch rounds until `budget` is spent, every source is exhausted,
    /// or cancellation is requested.
    ///
    /// Returns the number of rounds executed by this call. Cancellation is
    /// not an error here: `run` returns early with the rounds completed so far.
    ///
    /// # Errors
    ///
    /// [`ConfluxError::HandlerFailure`] from the first failing handler. The
    /// error replaces the count, but the failed round and every round before
    /// it are counted in [`rounds_completed`](Self::rounds_completed): read it
    /// before and after the call to recover how many rounds this call ran.
    pub async fn run(&mut self, budget: Budget) -> Result<usize> {
        let mut executed = 0;

        while budget.allows(executed) {
            match self.run_once().await {
                Ok(Some(_)) => executed += 1,
                Ok(None) => break,
                Err(ConfluxError::Cancelled) => {
                    tracing::debug!(executed, "Run cancelled");
                    break;
                },
                Err(error) => return Err(error),
            }
        }

        Ok(executed)
    }

    /// Stop considering a source.
    ///
    /// # Errors
    ///
    /// - [`ConfluxError::InvalidArgument`] if no source has this label
    /// - [`ConfluxError::StateError`] if the source is already exhausted or removed
    pub fn remove(&mut self, label: &str) -> Result<()> {
        let channel = self
            .channels
            .iter_mut()
            .find(|channel| channel.label == label)
            .ok_or_else(|| ConfluxError::invalid_argument(format!("unknown source `{label}`")))?;

        match channel.state {
            ChannelState::Active => {
                channel.state = ChannelState::Removed;
                tracing::debug!(source = %channel.label, "Source removed");
                Ok(())
            },
            ChannelState::Exhausted => Err(ConfluxError::state(format!(
                "source `{label}` is already exhausted"
            ))),
            ChannelState::Removed => Err(ConfluxError::state(format!(
                "source `{label}` was already removed"
            ))),
        }
    }

    /// Request cancellation of the current and every future round.
    ///
    /// Only this multiplexer is affected, not the token it was built with.
    pub fn cancel(&self) {
        tracing::debug!("Multiplexer cancellation requested");
        self.cancellation.cancel();
    }

    /// The multiplexer's own cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    /// Labels of every registered source, in registration order.
    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.channels.iter().map(|channel| &channel.label)
    }

    /// Number of sources still being waited on.
    #[must_use]
    pub fn active_sources(&self) -> usize {
        self.channels.iter().filter(|channel| channel.is_active()).count()
    }

    /// Whether the source is no longer considered (exhausted or removed).
    ///
    /// Returns `None` for an unknown label.
    #[must_use]
    pub fn is_exhausted(&self, label: &str) -> Option<bool> {
        self.channel(label).map(|channel| !channel.is_active())
    }

    /// Values handed to the source's handler so far.
    ///
    /// Returns `None` for an unknown label.
    #[must_use]
    pub fn deliveries(&self, label: &str) -> Option<u64> {
        self.channel(label).map(|channel| channel.deliveries)
    }

    /// Dispatch rounds completed over the multiplexer's lifetime.
    #[must_use]
    pub const fn rounds_completed(&self) -> usize {
        self.rounds
    }

    fn channel(&self, label: &str) -> Option<&Channel> {
        self.channels.iter().find(|channel| channel.label == label)
    }

    /// Source indices in the order this round polls them.
    fn scan_order(&self) -> Vec<usize> {
        let len = self.channels.len();
        match self.config.tie_break {
            TieBreak::RoundRobin => {
                let start = if len == 0 { 0 } else { self.cursor % len };
                (0..len).map(|offset| (start + offset) % len).collect()
            },
            TieBreak::Random => {
                let mut order: Vec<usize> = (0..len).collect();
                order.shuffle(&mut rand::thread_rng());
                order
            },
        }
    }

    fn dispatch(&mut self, index: usize, taken: Taken) -> Result<DispatchResult> {
        let channel = &mut self.channels[index];
        let label = channel.label.clone();

        match taken {
            Taken::Value(value) => {
                let started = Instant::now();
                let handled = channel.handler.call(value);
                channel.deliveries += 1;
                MultiplexerMetrics::record_round(&label, started.elapsed());

                if channel.source.is_exhausted() {
                    channel.mark_exhausted();
                }
                let exhausted = !channel.is_active();

                tracing::trace!(source = %label, exhausted, "Value dispatched");

                match handled {
                    Ok(()) => Ok(DispatchResult {
                        label,
                        outcome: DispatchOutcome::Delivered,
                        exhausted,
                    }),
                    Err(source) => {
                        MultiplexerMetrics::record_handler_failure(&label);
                        Err(ConfluxError::HandlerFailure { label, source })
                    },
                }
            },
            Taken::Failed(error) => {
                MultiplexerMetrics::record_source_failure(&label);
                channel.mark_exhausted();
                Ok(DispatchResult {
                    label,
                    outcome: DispatchOutcome::SourceFailed(error),
                    exhausted: true,
                })
            },
        }
    }
}

/// Scan the active sources once, in `order`.
///
/// Returns the first ready source's output. Sources reporting closure are
/// retired on the spot. `Ready(None)` means nothing is left to wait on.
fn poll_ready(
    channels: &mut [Channel],
    order: &[usize],
    cx: &mut Context<'_>,
) -> Poll<Option<(usize, Taken)>> {
    let mut waiting = false;

    for &index in order {
        let channel = &mut channels[index];
        if !channel.is_active() {
            continue;
        }

        match channel.source.poll_take(cx) {
            Poll::Ready(Readiness::Value(value)) => {
                return Poll::Ready(Some((index, Taken::Value(value))));
            },
            Poll::Ready(Readiness::Failed(error)) => {
                return Poll::Ready(Some((index, Taken::Failed(error))));
            },
            Poll::Ready(Readiness::Closed) => channel.mark_exhausted(),
            Poll::Pending => waiting = true,
        }
    }

    if waiting {
        Poll::Pending
    } else {
        Poll::Ready(None)
    }
}

impl fmt::Debug for FanInMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanInMultiplexer")
            .field("labels", &self.channels.iter().map(|c| c.label.as_str()).collect::<Vec<_>>())
            .field("active_sources", &self.active_sources())
            .field("rounds", &self.rounds)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`FanInMultiplexer`].
///
/// Sources and handlers may be registered separately and in any order; they
/// are paired by label when [`build`](Self::build) runs.
#[derive(Default)]
pub struct MultiplexerBuilder {
    sources: Vec<(Label, Box<dyn ErasedSource>)>,
    handlers: Vec<(Label, Box<dyn ErasedHandler>)>,
    config: MultiplexerConfig,
    cancellation: Option<Cancellation>,
}

impl MultiplexerBuilder {
    /// Register a source under `label`.
    #[must_use]
    pub fn source<S>(mut self, label: impl Into<Label>, source: S) -> Self
    where
        S: Source + 'static,
    {
        self.sources.push((label.into(), Box::new(SourceSlot(source))));
        self
    }

    /// Register an infallible handler for the source labeled `label`.
    #[must_use]
    pub fn handler<T, F>(self, label: impl Into<Label>, mut handler: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        self.try_handler(label, move |value: T| {
            handler(value);
            Ok::<(), BoxError>(())
        })
    }

    /// Register a fallible handler for the source labeled `label`.
    ///
    /// An `Err` surfaces from the round as [`ConfluxError::HandlerFailure`].
    #[must_use]
    pub fn try_handler<T, F, E>(mut self, label: impl Into<Label>, mut handler: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(T) -> std::result::Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        let erased = HandlerSlot {
            handler: move |value: T| -> std::result::Result<(), BoxError> {
                handler(value).map_err(Into::into)
            },
            _item: PhantomData,
        };
        self.handlers.push((label.into(), Box::new(erased)));
        self
    }

    /// Register a source and its handler in one call.
    #[must_use]
    pub fn channel<S, F>(self, label: impl Into<Label>, source: S, handler: F) -> Self
    where
        S: Source + 'static,
        F: FnMut(S::Item) + Send + 'static,
    {
        let label = label.into();
        self.source(label.clone(), source).handler(label, handler)
    }

    /// Set the multiplexer configuration.
    #[must_use]
    pub fn config(mut self, config: MultiplexerConfig) -> Self {
        self.config = config;
        self
    }

    /// Tie the multiplexer to a coordinator token.
    ///
    /// The multiplexer derives a child token: cancelling `parent` cancels the
    /// multiplexer, cancelling the multiplexer leaves `parent` untouched.
    #[must_use]
    pub fn cancellation(mut self, parent: &Cancellation) -> Self {
        self.cancellation = Some(parent.child());
        self
    }

    /// Pair sources with handlers and build the multiplexer.
    ///
    /// # Errors
    ///
    /// [`ConfluxError::InvalidArgument`] if:
    /// - two sources (or two handlers) share a label
    /// - a source has no handler, or a handler has no source
    /// - a handler's value type differs from its source's item type
    pub fn build(self) -> Result<FanInMultiplexer> {
        let mut seen = HashSet::new();
        for (label, _) in &self.sources {
            if !seen.insert(label.clone()) {
                return Err(ConfluxError::invalid_argument(format!(
                    "duplicate source label `{label}`"
                )));
            }
        }

        let mut handlers = Vec::with_capacity(self.handlers.len());
        let mut handler_labels = HashSet::new();
        for (label, handler) in self.handlers {
            if !handler_labels.insert(label.clone()) {
                return Err(ConfluxError::invalid_argument(format!(
                    "duplicate handler for source `{label}`"
                )));
            }
            if !seen.contains(&label) {
                return Err(ConfluxError::invalid_argument(format!(
                    "handler registered for unknown source `{label}`"
                )));
            }
            handlers.push((label, Some(handler)));
        }

        let mut channels = Vec::with_capacity(self.sources.len());
        for (label, source) in self.sources {
            let handler = handlers
                .iter_mut()
                .find(|(handler_label, _)| *handler_label == label)
                .and_then(|(_, handler)| handler.take())
                .ok_or_else(|| {
                    ConfluxError::invalid_argument(format!("source `{label}` has no handler"))
                })?;

            let (source_type, source_type_name) = source.item_type();
            let (handler_type, handler_type_name) = handler.item_type();
            if source_type != handler_type {
                return Err(ConfluxError::invalid_argument(format!(
                    "handler for source `{label}` accepts {handler_type_name}, but the source produces {source_type_name}"
                )));
            }

            channels.push(Channel {
                label,
                source,
                handler,
                state: ChannelState::Active,
                deliveries: 0,
            });
        }

        tracing::trace!(sources = channels.len(), "Fan-in multiplexer built");

        Ok(FanInMultiplexer {
            channels,
            config: self.config,
            cancellation: self.cancellation.unwrap_or_default(),
            cursor: 0,
            rounds: 0,
        })
    }
}

impl fmt::Debug for MultiplexerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexerBuilder")
            .field("sources", &self.sources.iter().map(|(l, _)| l.as_str()).collect::<Vec<_>>())
            .field("handlers", &self.handlers.iter().map(|(l, _)| l.as_str()).collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conflux_core::source;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_zero_sources_is_exhausted_immediately() {
        let mut mux = FanInMultiplexer::builder().build().unwrap();
        assert!(mux.run_once().await.unwrap().is_none());
        assert_eq!(mux.run(Budget::rounds(5)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_source_without_handler_is_invalid() {
        let result = FanInMultiplexer::builder()
            .source("chan1", source::once(async { 1_u8 }))
            .build();
        assert!(matches!(result, Err(ConfluxError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_handler_without_source_is_invalid() {
        let result = FanInMultiplexer::builder()
            .handler("ghost", |_: u8| {})
            .build();
        assert!(matches!(result, Err(ConfluxError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_duplicate_label_is_invalid() {
        let result = FanInMultiplexer::builder()
            .channel("chan1", source::once(async { 1_u8 }), |_| {})
            .channel("chan1", source::once(async { 2_u8 }), |_| {})
            .build();
        assert!(matches!(result, Err(ConfluxError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_mismatched_handler_type_is_invalid() {
        let result = FanInMultiplexer::builder()
            .source("chan1", source::once(async { 10_i32 }))
            .handler("chan1", |_: String| {})
            .build();

        match result {
            Err(ConfluxError::InvalidArgument(message)) => {
                assert!(message.contains("chan1"));
                assert!(message.contains("i32"));
            },
            other => unreachable!("expected InvalidArgument, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_separately_registered_handler_receives_values() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut mux = FanInMultiplexer::builder()
            .handler("numbers", move |v: u32| sink.lock().unwrap().push(v))
            .source("numbers", source::from_stream(futures::stream::iter(vec![1_u32, 2, 3])))
            .build()
            .unwrap();

        assert_eq!(mux.run(Budget::UntilExhausted).await.unwrap(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(mux.is_exhausted("numbers"), Some(true));
    }

    #[tokio::test]
    async fn test_one_shot_reports_exhaustion_in_same_round() {
        let mut mux = FanInMultiplexer::builder()
            .channel("chan1", source::once(async { 10 }), |_: i32| {})
            .build()
            .unwrap();

        let result = mux.run_once().await.unwrap().unwrap();
        assert_eq!(result.label, "chan1");
        assert!(result.is_delivered());
        assert!(result.exhausted);
        assert!(mux.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handler_failure_is_surfaced_after_round() {
        let mut mux = FanInMultiplexer::builder()
            .source("jobs", source::from_stream(futures::stream::iter(vec![1_u8, 2])))
            .try_handler("jobs", |v: u8| if v == 1 { Err("rejected") } else { Ok(()) })
            .build()
            .unwrap();

        let error = mux.run(Budget::UntilExhausted).await.unwrap_err();
        match error {
            ConfluxError::HandlerFailure { label, source } => {
                assert_eq!(label, "jobs");
                assert_eq!(source.to_string(), "rejected");
            },
            other => unreachable!("expected HandlerFailure, got {other:?}"),
        }
        assert_eq!(mux.rounds_completed(), 1);
        assert_eq!(mux.deliveries("jobs"), Some(1));

        // Not retried: the next round delivers the next value.
        assert!(mux.run_once().await.unwrap().unwrap().is_delivered());
        assert_eq!(mux.deliveries("jobs"), Some(2));
    }

    #[tokio::test]
    async fn test_source_failure_reported_once() {
        let mut mux = FanInMultiplexer::builder()
            .channel(
                "flaky",
                source::try_once(async { Err::<u8, _>("producer crashed") }),
                |_| {},
            )
            .build()
            .unwrap();

        let result = mux.run_once().await.unwrap().unwrap();
        assert!(matches!(result.outcome, DispatchOutcome::SourceFailed(_)));
        assert!(result.exhausted);
        assert_eq!(mux.deliveries("flaky"), Some(0));
        assert!(mux.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_source_does_not_consume_a_round() {
        let (tx, rx) = mpsc::channel::<u8>(1);
        drop(tx);

        let mut mux = FanInMultiplexer::builder()
            .channel("closed", source::from_receiver(rx), |_| {})
            .channel("chan1", source::once(async { 1_u8 }), |_| {})
            .build()
            .unwrap();

        let result = mux.run_once().await.unwrap().unwrap();
        assert_eq!(result.label, "chan1");
        assert!(result.exhausted);
        assert_eq!(mux.rounds_completed(), 1);

        // Retired during the wait: no result named it, but the query does.
        assert_eq!(mux.is_exhausted("closed"), Some(true));
        assert_eq!(mux.active_sources(), 0);
    }

    #[tokio::test]
    async fn test_remove_source() {
        let mut mux = FanInMultiplexer::builder()
            .channel("never", source::pending::<u8>(), |_| {})
            .channel("once", source::once(async { 1_u8 }), |_| {})
            .build()
            .unwrap();

        mux.remove("never").unwrap();
        assert!(matches!(mux.remove("never"), Err(ConfluxError::StateError(_))));
        assert!(matches!(mux.remove("missing"), Err(ConfluxError::InvalidArgument(_))));

        assert_eq!(mux.run(Budget::UntilExhausted).await.unwrap(), 1);
        assert!(matches!(mux.remove("once"), Err(ConfluxError::StateError(_))));
    }

    #[tokio::test]
    async fn test_run_once_timeout_consumes_nothing() {
        let (tx, rx) = mpsc::channel(1);
        let mut mux = FanInMultiplexer::builder()
            .channel("late", source::from_receiver(rx), |_: u8| {})
            .build()
            .unwrap();

        let result = mux.run_once_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ConfluxError::Timeout(_))));
        assert_eq!(mux.rounds_completed(), 0);

        tx.send(1).await.unwrap();
        assert!(mux.run_once().await.unwrap().unwrap().is_delivered());
    }

    #[tokio::test]
    async fn test_run_once_bounded_uses_config() {
        let config = MultiplexerConfig::builder()
            .round_timeout(Duration::from_millis(20))
            .build();
        let mut mux = FanInMultiplexer::builder()
            .channel("never", source::pending::<u8>(), |_| {})
            .config(config)
            .build()
            .unwrap();

        assert!(matches!(
            mux.run_once_bounded().await,
            Err(ConfluxError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let mut mux = FanInMultiplexer::builder()
            .channel("never", source::pending::<u8>(), |_| {})
            .build()
            .unwrap();
        let token = mux.cancellation();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        assert!(matches!(mux.run_once().await, Err(ConfluxError::Cancelled)));
        assert_eq!(mux.run(Budget::rounds(3)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_round_robin_alternates_between_ready_sources() {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        for i in 0..4_u8 {
            tx_a.send(i).unwrap();
            tx_b.send(i).unwrap();
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let (order_a, order_b) = (Arc::clone(&order), Arc::clone(&order));
        let mut mux = FanInMultiplexer::builder()
            .channel("a", source::from_unbounded(rx_a), move |_| {
                order_a.lock().unwrap().push("a");
            })
            .channel("b", source::from_unbounded(rx_b), move |_| {
                order_b.lock().unwrap().push("b");
            })
            .build()
            .unwrap();

        assert_eq!(mux.run(Budget::rounds(4)).await.unwrap(), 4);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_budget_allows() {
        assert!(Budget::rounds(2).allows(1));
        assert!(!Budget::rounds(2).allows(2));
        assert!(!Budget::rounds(0).allows(0));
        assert!(Budget::UntilExhausted.allows(usize::MAX));
    }
}
