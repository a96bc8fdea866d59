//! Source labels.
//!
//! A [`Label`] names one source (and its handler) inside a fan-in
//! multiplexer. Labels are cheap to clone because every dispatch round hands
//! one back to the caller.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Error type for `Label` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid label: {0}")]
pub struct ParseLabelError(String);

/// Name of a source registered with a multiplexer.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty or whitespace-only input
/// - `From::from()` and `new()`: no validation (trusted, application-controlled input)
///
/// # Examples
///
/// ```
/// use conflux_core::label::Label;
///
/// let label = Label::new("chan1");
/// assert_eq!(label.as_str(), "chan1");
///
/// let parsed: Label = "chan2".parse().unwrap();
/// assert_eq!(parsed, Label::from("chan2"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(Arc<str>);

impl Label {
    /// Create a new `Label`.
    #[must_use]
    pub fn new(label: impl AsRef<str>) -> Self {
        Self(Arc::from(label.as_ref()))
    }

    /// Get the label as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Label {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

impl From<String> for Label {
    fn from(label: String) -> Self {
        Self(Arc::from(label))
    }
}

impl From<&Label> for Label {
    fn from(label: &Label) -> Self {
        label.clone()
    }
}

impl AsRef<str> for Label {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Label {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for Label {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

impl FromStr for Label {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseLabelError("label cannot be empty".to_string()));
        }
        Ok(Self::new(s))
    }
}
