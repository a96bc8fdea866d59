//! Cooperative cancellation.
//!
//! [`Cancellation`] wraps a `tokio_util` [`CancellationToken`]. Clones share
//! one state: any clone may cancel, every clone observes it.
//!
//! Tokens form a tree through [`Cancellation::child`]: cancelling a parent
//! cancels all of its children, cancelling a child leaves the parent alone.
//! Components derive a child from the token they are handed, so a single
//! coordinator token (for example one tripped by Ctrl+C) reaches every
//! component while each component's own `cancel()` stays local.
//!
//! # Example
//!
//! ```
//! use conflux_core::Cancellation;
//!
//! let shutdown = Cancellation::new();
//! let aggregate_token = shutdown.child();
//!
//! aggregate_token.cancel();
//! assert!(!shutdown.is_cancelled());
//!
//! shutdown.cancel();
//! assert!(shutdown.child().is_cancelled());
//! ```

use tokio_util::sync::CancellationToken;

/// Cloneable cooperative cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: CancellationToken,
}

impl Cancellation {
    /// Create a new, uncancelled root token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a child token that is cancelled whenever `self` is.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether this token or any of its ancestors has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until this token (or an ancestor) is cancelled.
    ///
    /// Returns immediately if cancellation was already requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The underlying token, for APIs that take a `CancellationToken`.
    #[must_use]
    pub fn as_token(&self) -> &CancellationToken {
        &self.token
    }
}

impl From<CancellationToken> for Cancellation {
    fn from(token: CancellationToken) -> Self {
        Self { token }
    }
}
