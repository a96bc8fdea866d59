//! # Conflux Runtime
//!
//! Runtime components for Conflux.
//!
//! This crate provides the two concurrency primitives built on the
//! vocabulary in `conflux-core`.
//!
//! ## Core Components
//!
//! - **`SharedAggregate`**: a lock-guarded accumulator that many concurrent
//!   contributors update, finalized once a known number of them have
//!   contributed
//! - **`FanInMultiplexer`**: waits on several labeled sources at once and
//!   dispatches exactly one ready value per round to that source's handler
//! - **Metrics**: Prometheus counters and histograms for both components
//!
//! ## Example
//!
//! ```rust
//! use conflux_runtime::SharedAggregate;
//!
//! # async fn example() -> conflux_core::Result<()> {
//! let views = SharedAggregate::<u64, u64>::new(0, 3)?;
//!
//! for _ in 0..3 {
//!     let views = views.clone();
//!     tokio::spawn(async move { views.contribute(1).await });
//! }
//!
//! assert_eq!(views.await_finalized().await?, 3);
//! # Ok(())
//! # }
//! ```

/// Shared accumulator with a finalization barrier
pub mod aggregate;

/// Fan-in multiplexer over labeled sources
pub mod multiplexer;

/// Prometheus metrics for observability
pub mod metrics;

pub use aggregate::{AggregateBuilder, AggregateConfig, AggregateConfigBuilder, SharedAggregate};
pub use multiplexer::{
    Budget, DispatchOutcome, DispatchResult, FanInMultiplexer, MultiplexerBuilder,
    MultiplexerConfig, MultiplexerConfigBuilder, TieBreak,
};
