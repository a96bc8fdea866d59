//! Post views example
//!
//! Settings for the `post-views` binary: how many concurrent viewers to
//! simulate. The metrics address is read by
//! [`MetricsEndpoint::from_env`](conflux_runtime::metrics::MetricsEndpoint::from_env),
//! the same way every conflux binary reads it.

use thiserror::Error;

/// Environment variable holding the number of concurrent viewers.
pub const WORKERS_VAR: &str = "POST_VIEWS_WORKERS";

/// Viewers simulated when `POST_VIEWS_WORKERS` is unset.
pub const DEFAULT_WORKERS: usize = 100;

/// Invalid environment settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Worker count is not a non-negative integer
    #[error("POST_VIEWS_WORKERS must be a non-negative integer, got `{value}`")]
    InvalidWorkers {
        /// Raw value
        value: String,
        /// Parse failure
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Settings for the post views binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Number of concurrent viewers, each adding one view
    pub workers: usize,
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] if a variable is set but malformed.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] if a variable is set but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let workers = match lookup(WORKERS_VAR) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|source| SettingsError::InvalidWorkers { value, source })?,
            None => DEFAULT_WORKERS,
        };

        Ok(Self { workers })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn test_explicit_values() {
        let settings = Settings::from_lookup(lookup(&[
            (WORKERS_VAR, " 8 "),
            ("CONFLUX_METRICS_ADDR", "127.0.0.1:9000"),
        ]))
        .unwrap();
        assert_eq!(settings, Settings { workers: 8 });
    }

    #[test]
    fn test_negative_workers_rejected() {
        let result = Settings::from_lookup(lookup(&[(WORKERS_VAR, "-1")]));
        assert!(matches!(result, Err(SettingsError::InvalidWorkers { .. })));
    }

    proptest! {
        #[test]
        fn any_worker_count_round_trips(n in 0_usize..100_000) {
            let settings = Settings::from_lookup(lookup(&[(WORKERS_VAR, &n.to_string())])).unwrap();
            prop_assert_eq!(settings.workers, n);
        }
    }
}
