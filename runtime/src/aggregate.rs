//! Shared aggregate with a finalization barrier.
//!
//! A [`SharedAggregate`] holds one accumulator behind a single coarse lock.
//! Each of `expected` contributors applies exactly one contribution; after
//! the last one the value is published through a `watch` channel and becomes
//! readable without the lock.
//!
//! # Lifecycle
//!
//! ```text
//! new(initial, N) ──contribute × N──▶ finalized ──await_finalized──▶ value
//!        │                                │
//!        └──────── cancel ───────▶ waiters released with Cancelled
//! ```
//!
//! The guarded region is only read, combine, write, decrement. Contention is
//! expected to be "many short critical sections", which one lock serves well.
//!
//! # Example
//!
//! ```rust
//! use conflux_runtime::SharedAggregate;
//!
//! # async fn example() -> conflux_core::Result<()> {
//! let views = SharedAggregate::<u64, u64>::new(0, 100)?;
//!
//! for _ in 0..100 {
//!     let views = views.clone();
//!     tokio::spawn(async move { views.contribute(1).await });
//! }
//!
//! assert_eq!(views.await_finalized().await?, 100);
//! # Ok(())
//! # }
//! ```

use crate::metrics::AggregateMetrics;
use conflux_core::combine::{Combine, Sum};
use conflux_core::{Cancellation, ConfluxError, Result};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};

/// Aggregate configuration.
///
/// The bounds are used by [`SharedAggregate::contribute_bounded`] and
/// [`SharedAggregate::await_finalized_bounded`]; `None` means wait forever.
#[derive(Debug, Clone, Default)]
pub struct AggregateConfig {
    /// Maximum time a contributor waits for the lock
    pub lock_timeout: Option<Duration>,
    /// Maximum time a coordinator waits for finalization
    pub finalize_timeout: Option<Duration>,
}

impl AggregateConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> AggregateConfigBuilder {
        AggregateConfigBuilder {
            lock_timeout: None,
            finalize_timeout: None,
        }
    }
}

/// Builder for [`AggregateConfig`].
#[derive(Debug, Clone)]
pub struct AggregateConfigBuilder {
    lock_timeout: Option<Duration>,
    finalize_timeout: Option<Duration>,
}

impl AggregateConfigBuilder {
    /// Bound the lock wait of [`SharedAggregate::contribute_bounded`].
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Bound the wait of [`SharedAggregate::await_finalized_bounded`].
    #[must_use]
    pub const fn finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub const fn build(self) -> AggregateConfig {
        AggregateConfig {
            lock_timeout: self.lock_timeout,
            finalize_timeout: self.finalize_timeout,
        }
    }
}

/// State guarded by the aggregate lock.
///
/// `value` is `Some` while `pending > 0` and moves into the finalization
/// channel when `pending` reaches zero.
struct Slot<A> {
    value: Option<A>,
    pending: usize,
}

struct Shared<A, C> {
    slot: Mutex<Slot<A>>,
    combine: C,
    expected: usize,
    finalized: watch::Sender<Option<A>>,
    cancellation: Cancellation,
    config: AggregateConfig,
}

/// An accumulator safely mutated by a fixed number of concurrent contributors.
///
/// Cloning is cheap and yields another handle to the same aggregate; hand one
/// clone to each contributor.
///
/// # Type Parameters
///
/// - `A`: Accumulator type
/// - `D`: Contribution (delta) type
/// - `C`: Combiner folding a `D` into an `A` (defaults to [`Sum`])
pub struct SharedAggregate<A, D, C = Sum> {
    shared: Arc<Shared<A, C>>,
    _delta: PhantomData<fn(D)>,
}

impl<A, D, C> Clone for SharedAggregate<A, D, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _delta: PhantomData,
        }
    }
}

impl<A, D> SharedAggregate<A, D, Sum>
where
    A: Send + Sync,
{
    /// Create an aggregate that sums contributions.
    ///
    /// `expected_contributors` may be any integer type; negative or
    /// out-of-range counts are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ConfluxError::InvalidArgument`] if `expected_contributors < 0`.
    pub fn new<N>(initial: A, expected_contributors: N) -> Result<Self>
    where
        N: TryInto<usize> + Copy + fmt::Display,
        Sum: Combine<A, D>,
    {
        Self::builder(initial, expected_contributors).build()
    }

    /// Start building an aggregate with a custom combiner, configuration or
    /// cancellation token.
    #[must_use]
    pub fn builder<N>(initial: A, expected_contributors: N) -> AggregateBuilder<A, Sum>
    where
        N: TryInto<usize> + Copy + fmt::Display,
    {
        let expected = expected_contributors.try_into().map_err(|_| {
            ConfluxError::invalid_argument(format!(
                "expected contributor count must be a non-negative integer, got {expected_contributors}"
            ))
        });

        AggregateBuilder {
            initial,
            expected,
            combine: Sum,
            config: AggregateConfig::default(),
            cancellation: None,
        }
    }
}

impl<A, D, C> SharedAggregate<A, D, C>
where
    A: Send + Sync,
    C: Combine<A, D>,
{
    /// Create an aggregate with a caller-supplied combiner.
    ///
    /// # Errors
    ///
    /// Returns [`ConfluxError::InvalidArgument`] if `expected_contributors < 0`.
    pub fn with_combine<N>(initial: A, expected_contributors: N, combine: C) -> Result<Self>
    where
        N: TryInto<usize> + Copy + fmt::Display,
    {
        SharedAggregate::<A, D, Sum>::builder(initial, expected_contributors)
            .combine(combine)
            .build()
    }

    /// Apply one contribution, waiting as long as needed for the lock.
    ///
    /// # Errors
    ///
    /// - [`ConfluxError::StateError`] if every expected contribution has
    ///   already been applied (the aggregate is finalized)
    /// - [`ConfluxError::Cancelled`] if the aggregate was cancelled
    pub async fn contribute(&self, delta: D) -> Result<()> {
        let started = Instant::now();
        let mut slot = self.shared.slot.lock().await;
        self.apply(&mut slot, delta, started.elapsed())
    }

    /// Apply one contribution, giving up if the lock is not acquired within
    /// `timeout`. Nothing is applied on timeout.
    ///
    /// # Errors
    ///
    /// [`ConfluxError::Timeout`], plus everything [`contribute`](Self::contribute) returns.
    pub async fn contribute_timeout(&self, delta: D, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let mut slot = tokio::time::timeout(timeout, self.shared.slot.lock())
            .await
            .map_err(|_| ConfluxError::Timeout(timeout))?;
        self.apply(&mut slot, delta, started.elapsed())
    }

    /// Apply one contribution without waiting, for synchronous callers such
    /// as multiplexer handlers.
    ///
    /// Nothing is applied when another contributor holds the lock, so the
    /// caller may retry or fall back to [`contribute`](Self::contribute).
    ///
    /// # Errors
    ///
    /// - [`ConfluxError::Timeout`] with a zero duration if the lock is busy
    /// - everything [`contribute`](Self::contribute) returns
    pub fn try_contribute(&self, delta: D) -> Result<()> {
        let mut slot = self
            .shared
            .slot
            .try_lock()
            .map_err(|_| ConfluxError::Timeout(Duration::ZERO))?;
        self.apply(&mut slot, delta, Duration::ZERO)
    }

    /// [`contribute`](Self::contribute) bounded by the configured `lock_timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`contribute_timeout`](Self::contribute_timeout).
    pub async fn contribute_bounded(&self, delta: D) -> Result<()> {
        match self.shared.config.lock_timeout {
            Some(timeout) => self.contribute_timeout(delta, timeout).await,
            None => self.contribute(delta).await,
        }
    }

    fn apply(&self, slot: &mut Slot<A>, delta: D, lock_wait: Duration) -> Result<()> {
        if self.shared.cancellation.is_cancelled() {
            AggregateMetrics::record_rejection();
            return Err(ConfluxError::Cancelled);
        }

        let value = match slot.value.as_mut() {
            Some(value) if slot.pending > 0 => value,
            _ => {
                AggregateMetrics::record_rejection();
                return Err(ConfluxError::state(format!(
                    "aggregate already finalized after {} contributions",
                    self.shared.expected
                )));
            },
        };

        self.shared.combine.combine(value, delta);
        slot.pending -= 1;
        AggregateMetrics::record_contribution(lock_wait);

        if slot.pending == 0 {
            if let Some(final_value) = slot.value.take() {
                self.shared.finalized.send_replace(Some(final_value));
            }
            AggregateMetrics::record_finalized();
            tracing::debug!(contributors = self.shared.expected, "Aggregate finalized");
        } else {
            tracing::trace!(pending = slot.pending, "Contribution applied");
        }

        Ok(())
    }
}

impl<A, D, C> SharedAggregate<A, D, C>
where
    A: Send + Sync,
{
    /// Wait until every expected contributor has contributed, then return the
    /// final value.
    ///
    /// If the aggregate is already finalized the value is returned even when
    /// cancellation has also been requested.
    ///
    /// # Errors
    ///
    /// [`ConfluxError::Cancelled`] if the aggregate is cancelled first.
    pub async fn await_finalized(&self) -> Result<A>
    where
        A: Clone,
    {
        let mut finalized = self.shared.finalized.subscribe();

        tokio::select! {
            biased;

            result = finalized.wait_for(Option::is_some) => {
                let current = result
                    .map_err(|_| ConfluxError::state("finalization channel closed"))?;
                let value: Option<A> = (*current).clone();
                value.ok_or_else(|| ConfluxError::state("finalized aggregate has no value"))
            }

            () = self.shared.cancellation.cancelled() => {
                tracing::debug!("Finalization wait cancelled");
                Err(ConfluxError::Cancelled)
            }
        }
    }

    /// [`await_finalized`](Self::await_finalized) with a deadline.
    ///
    /// # Errors
    ///
    /// [`ConfluxError::Timeout`] if `timeout` elapses first, or
    /// [`ConfluxError::Cancelled`].
    pub async fn await_finalized_timeout(&self, timeout: Duration) -> Result<A>
    where
        A: Clone,
    {
        tokio::time::timeout(timeout, self.await_finalized())
            .await
            .map_err(|_| ConfluxError::Timeout(timeout))?
    }

    /// [`await_finalized`](Self::await_finalized) bounded by the configured
    /// `finalize_timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`await_finalized_timeout`](Self::await_finalized_timeout).
    pub async fn await_finalized_bounded(&self) -> Result<A>
    where
        A: Clone,
    {
        match self.shared.config.finalize_timeout {
            Some(timeout) => self.await_finalized_timeout(timeout).await,
            None => self.await_finalized().await,
        }
    }

    /// The final value, if the aggregate is finalized. Never blocks.
    #[must_use]
    pub fn try_finalized(&self) -> Option<A>
    where
        A: Clone,
    {
        self.shared.finalized.borrow().clone()
    }

    /// Whether every expected contribution has been applied.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.shared.finalized.borrow().is_some()
    }

    /// Number of contributions still outstanding.
    pub async fn pending(&self) -> usize {
        self.shared.slot.lock().await.pending
    }

    /// Number of contributors the aggregate was created for.
    #[must_use]
    pub fn expected(&self) -> usize {
        self.shared.expected
    }

    /// Release every `await_finalized` waiter with `Cancelled` and reject
    /// further contributions.
    ///
    /// Only this aggregate is affected, not the token it was built with.
    pub fn cancel(&self) {
        tracing::debug!("Aggregate cancellation requested");
        self.shared.cancellation.cancel();
    }

    /// Whether cancellation has been requested (directly or via a parent token).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancellation.is_cancelled()
    }

    /// The aggregate's own cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> Cancellation {
        self.shared.cancellation.clone()
    }
}

impl<A, D, C> fmt::Debug for SharedAggregate<A, D, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedAggregate")
            .field("expected", &self.shared.expected)
            .field("finalized", &self.shared.finalized.borrow().is_some())
            .field("cancelled", &self.shared.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Builder for [`SharedAggregate`].
///
/// Created by [`SharedAggregate::builder`].
pub struct AggregateBuilder<A, C> {
    initial: A,
    expected: Result<usize>,
    combine: C,
    config: AggregateConfig,
    cancellation: Option<Cancellation>,
}

impl<A, C> AggregateBuilder<A, C> {
    /// Use `combine` to fold contributions.
    #[must_use]
    pub fn combine<C2>(self, combine: C2) -> AggregateBuilder<A, C2> {
        AggregateBuilder {
            initial: self.initial,
            expected: self.expected,
            combine,
            config: self.config,
            cancellation: self.cancellation,
        }
    }

    /// Set the bounded-wait configuration.
    #[must_use]
    pub fn config(mut self, config: AggregateConfig) -> Self {
        self.config = config;
        self
    }

    /// Tie the aggregate to a coordinator token.
    ///
    /// The aggregate derives a child token: cancelling `parent` cancels the
    /// aggregate, cancelling the aggregate leaves `parent` untouched.
    #[must_use]
    pub fn cancellation(mut self, parent: &Cancellation) -> Self {
        self.cancellation = Some(parent.child());
        self
    }

    /// Build the aggregate.
    ///
    /// An aggregate expecting zero contributors is finalized immediately.
    ///
    /// # Errors
    ///
    /// [`ConfluxError::InvalidArgument`] if the contributor count was negative.
    pub fn build<D>(self) -> Result<SharedAggregate<A, D, C>>
    where
        A: Send + Sync,
        C: Combine<A, D>,
    {
        let expected = self.expected?;

        let (value, finalized) = if expected == 0 {
            (None, Some(self.initial))
        } else {
            (Some(self.initial), None)
        };
        let (finalized, _rx) = watch::channel(finalized);

        tracing::trace!(expected, "Shared aggregate created");

        Ok(SharedAggregate {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    value,
                    pending: expected,
                }),
                combine: self.combine,
                expected,
                finalized,
                cancellation: self.cancellation.unwrap_or_default(),
                config: self.config,
            }),
            _delta: PhantomData,
        })
    }
}

impl<A, C> fmt::Debug for AggregateBuilder<A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateBuilder")
            .field("expected", &self.expected.as_ref().ok())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
