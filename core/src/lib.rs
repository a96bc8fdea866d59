//! # Conflux Core
//!
//! Core traits and types for Conflux, a small concurrent aggregation toolkit.
//!
//! This crate provides the vocabulary shared by the runtime components:
//!
//! - **Combine**: how a contribution is folded into a shared accumulator
//! - **Source**: a labeled producer with a ready / blocked / exhausted tri-state
//! - **Cancellation**: a cooperative, cloneable cancellation token
//! - **Errors**: the failure taxonomy every operation reports through
//!
//! ## Architecture Principles
//!
//! - Explicit ownership (no ambient or global state)
//! - Failures are returned to the immediate caller, never swallowed
//! - Waiting is always notification-driven, never polling loops
//!
//! ## Example
//!
//! ```
//! use conflux_core::combine::{Combine, Sum};
//!
//! let mut views = 0_u64;
//! Sum.combine(&mut views, 1);
//! Sum.combine(&mut views, 1);
//! assert_eq!(views, 2);
//! ```

/// Combiners - how contributions are folded into an accumulator
pub mod combine;

/// Event sources consumed by a fan-in multiplexer
pub mod source;

/// Cooperative cancellation tokens
pub mod cancellation;

/// Source labels
pub mod label;

/// Error types shared by all Conflux components
pub mod error {
    use crate::label::Label;
    use std::time::Duration;
    use thiserror::Error;

    /// Boxed error used for failures raised by caller-supplied code
    /// (handlers and source producers).
    pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

    /// Errors reported by Conflux components
    ///
    /// Every variant is returned to the immediate caller of the failing
    /// operation. No component retries or logs-and-drops an error.
    #[derive(Error, Debug)]
    pub enum ConfluxError {
        /// Malformed construction parameters
        ///
        /// Negative contributor counts, sources without handlers, duplicate
        /// labels. Fatal to the construction call only.
        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        /// A component was used outside its contract
        ///
        /// For example contributing after finalization, or removing a source
        /// that is already exhausted.
        #[error("Invalid state: {0}")]
        StateError(String),

        /// A bounded wait was not satisfied before its deadline
        #[error("Timed out after {0:?}")]
        Timeout(Duration),

        /// A cancellation request released a suspended wait
        #[error("Operation cancelled")]
        Cancelled,

        /// A handler failed while processing a dispatched value
        ///
        /// The dispatch round is still counted as complete: the value was
        /// consumed from its source and is not redelivered.
        #[error("Handler for source `{label}` failed: {source}")]
        HandlerFailure {
            /// Label of the source whose handler failed
            label: Label,
            /// Error raised by the handler
            #[source]
            source: BoxError,
        },
    }

    impl ConfluxError {
        /// Whether the caller may reasonably retry or restart the operation.
        ///
        /// `Timeout` and `Cancelled` are recoverable; the rest indicate a
        /// contract violation or a failed handler.
        #[must_use]
        pub const fn is_recoverable(&self) -> bool {
            matches!(self, Self::Timeout(_) | Self::Cancelled)
        }

        /// Shorthand for building an [`InvalidArgument`](Self::InvalidArgument).
        pub fn invalid_argument(message: impl Into<String>) -> Self {
            Self::InvalidArgument(message.into())
        }

        /// Shorthand for building a [`StateError`](Self::StateError).
        pub fn state(message: impl Into<String>) -> Self {
            Self::StateError(message.into())
        }
    }

    /// Result alias used throughout Conflux
    pub type Result<T> = std::result::Result<T, ConfluxError>;
}

// Re-export commonly used types
pub use cancellation::Cancellation;
pub use combine::{Combine, Sum};
pub use error::{BoxError, ConfluxError, Result};
pub use label::Label;
pub use source::{Readiness, Source};
