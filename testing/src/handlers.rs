//! Handlers that record or reject what they receive.

#![allow(clippy::module_name_repetitions)]

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Error returned by [`failing_handler`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("handler rejected value: {0}")]
pub struct TestFailure(pub String);

/// Collects every value handed to its handlers, in delivery order.
///
/// Clones share the same log.
///
/// # Example
///
/// ```
/// use conflux_testing::Recorder;
///
/// let recorder = Recorder::new();
/// let mut handler = recorder.handler();
/// handler(1);
/// handler(2);
/// assert_eq!(recorder.values(), vec![1, 2]);
/// ```
pub struct Recorder<T> {
    log: Arc<Mutex<Vec<T>>>,
}

impl<T> Recorder<T> {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn log(&self) -> MutexGuard<'_, Vec<T>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A handler that appends each value to this recorder.
    pub fn handler(&self) -> impl FnMut(T) + Send + 'static + use<T>
    where
        T: Send + 'static,
    {
        let log = Arc::clone(&self.log);
        move |value: T| log.lock().unwrap_or_else(PoisonError::into_inner).push(value)
    }

    /// Number of values recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log().len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log().is_empty()
    }

    /// Snapshot of the recorded values.
    #[must_use]
    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.log().clone()
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
        }
    }
}

impl<T> fmt::Debug for Recorder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder").field("len", &self.len()).finish()
    }
}

/// A fallible handler that rejects values matching `reject`.
pub fn failing_handler<T, P>(mut reject: P) -> impl FnMut(T) -> Result<(), TestFailure> + Send + 'static
where
    T: fmt::Debug + Send + 'static,
    P: FnMut(&T) -> bool + Send + 'static,
{
    move |value: T| {
        if reject(&value) {
            Err(TestFailure(format!("{value:?}")))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_clones_share_log() {
        let recorder = Recorder::new();
        let mut first = recorder.handler();
        let mut second = recorder.clone().handler();

        first("a");
        second("b");

        assert_eq!(recorder.values(), vec!["a", "b"]);
        assert_eq!(recorder.len(), 2);
    }

    #[test]
    fn test_failing_handler_rejects_matching_values() {
        let mut handler = failing_handler(|v: &u8| *v > 1);
        assert_eq!(handler(1), Ok(()));
        assert_eq!(handler(2), Err(TestFailure("2".to_string())));
    }
}
