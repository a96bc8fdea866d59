//! # Conflux Testing
//!
//! Testing utilities and helpers for Conflux.
//!
//! This crate provides:
//! - Hand-driven sources whose readiness a test controls step by step
//! - Recording and failing handlers for multiplexer tests
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```
//! use conflux_testing::{ManualSource, Recorder};
//!
//! let (source, handle) = ManualSource::<u32>::new();
//! let recorder = Recorder::<u32>::new();
//!
//! handle.push(7);
//! handle.close();
//! assert_eq!(handle.queued(), 1);
//!
//! let mut record = recorder.handler();
//! record(7);
//! assert_eq!(recorder.values(), vec![7]);
//! # drop(source);
//! ```

/// Hand-driven sources
pub mod sources;

/// Recording and failing handlers
pub mod handlers;

/// Property-based testing utilities
///
/// Strategies for the inputs the aggregation properties quantify over.
pub mod properties {
    use proptest::prelude::*;

    /// Number of concurrent contributors, including the degenerate single one.
    pub fn contributor_counts() -> impl Strategy<Value = usize> {
        1_usize..=64
    }

    /// Per-contributor delta, small enough that any sum fits in a `u64`.
    pub fn deltas() -> impl Strategy<Value = u64> {
        0_u64..1_000
    }

    /// A batch of deltas, one per contributor.
    pub fn delta_batches() -> impl Strategy<Value = Vec<u64>> {
        prop::collection::vec(deltas(), 1..=64)
    }

    /// Number of values a source produces before closing.
    pub fn burst_sizes() -> impl Strategy<Value = usize> {
        0_usize..=32
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use handlers::{Recorder, TestFailure, failing_handler};
pub use sources::{AlwaysReady, ManualHandle, ManualSource};

#[cfg(test)]
mod tests {
    use super::properties::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn delta_batches_are_never_empty(batch in delta_batches()) {
            prop_assert!(!batch.is_empty());
            prop_assert!(batch.len() <= 64);
        }

        #[test]
        fn contributor_counts_are_positive(n in contributor_counts()) {
            prop_assert!(n >= 1);
        }
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        super::init_tracing();
        super::init_tracing();
    }
}
