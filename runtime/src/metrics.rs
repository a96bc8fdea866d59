//! Prometheus metrics for the aggregate and the multiplexer.
//!
//! Both components record unconditionally through the `metrics` macros; with
//! no recorder installed the macros are no-ops. A host that wants the numbers
//! starts a [`MetricsEndpoint`], which installs the Prometheus recorder and
//! serves the text exposition format over HTTP at its address.
//!
//! The address comes from `CONFLUX_METRICS_ADDR` (see
//! [`MetricsEndpoint::from_env`]); when it is unset nothing is served.
//!
//! # Example
//!
//! ```rust,no_run
//! use conflux_runtime::metrics::MetricsEndpoint;
//!
//! # async fn example() -> Result<(), conflux_runtime::metrics::MetricsError> {
//! if let Some(mut endpoint) = MetricsEndpoint::from_env()? {
//!     endpoint.start()?;
//!     println!("scrape http://{}/", endpoint.addr());
//! }
//! # Ok(())
//! # }
//! ```

use conflux_core::Label;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::fmt;
use std::net::{AddrParseError, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the address metrics are served on.
pub const METRICS_ADDR_VAR: &str = "CONFLUX_METRICS_ADDR";

/// Histogram buckets for lock waits and handler time, in seconds.
const LATENCY_BUCKETS: &[f64] = &[
    0.000_001, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 1.0,
];

/// Errors from starting the metrics endpoint.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// `CONFLUX_METRICS_ADDR` is set but is not a socket address
    #[error("CONFLUX_METRICS_ADDR must be a socket address, got `{value}`")]
    InvalidAddr {
        /// Raw value of the variable
        value: String,
        /// Parse failure
        #[source]
        source: AddrParseError,
    },
    /// The exporter could not be built or its listener could not bind
    #[error("cannot serve metrics on {addr}: {reason}")]
    Listen {
        /// Address the listener tried to bind
        addr: SocketAddr,
        /// Exporter error text
        reason: String,
    },
    /// Another recorder is already installed in this process
    #[error("a metrics recorder is already installed")]
    AlreadyInstalled,
}

/// HTTP endpoint serving conflux metrics in Prometheus format.
pub struct MetricsEndpoint {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsEndpoint {
    /// Endpoint that will serve on `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Endpoint configured by `CONFLUX_METRICS_ADDR`, or `None` when unset.
    ///
    /// # Errors
    ///
    /// [`MetricsError::InvalidAddr`] if the variable does not parse.
    pub fn from_env() -> Result<Option<Self>, MetricsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) against an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// [`MetricsError::InvalidAddr`] if the variable does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>, MetricsError> {
        lookup(METRICS_ADDR_VAR)
            .map(|value| {
                value
                    .parse()
                    .map(Self::new)
                    .map_err(|source| MetricsError::InvalidAddr { value, source })
            })
            .transpose()
    }

    /// Install the Prometheus recorder globally and start serving it.
    ///
    /// The listener is bound before this returns; the server itself runs as a
    /// task on the current Tokio runtime, so this must be called from inside
    /// one.
    ///
    /// # Errors
    ///
    /// - [`MetricsError::Listen`] if the address cannot be bound
    /// - [`MetricsError::AlreadyInstalled`] if another recorder owns the process
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = exposition()
            .and_then(|builder| builder.with_http_listener(self.addr).build())
            .map_err(|e| MetricsError::Listen {
                addr: self.addr,
                reason: e.to_string(),
            })?;
        let handle = recorder.handle();

        metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;
        register_metrics();

        let addr = self.addr;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::warn!(%addr, "Metrics listener stopped");
            }
        });

        tracing::info!(%addr, "Serving metrics");
        self.handle = Some(handle);
        Ok(())
    }

    /// Address metrics are served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current exposition text, or `None` before [`start`](Self::start).
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

impl fmt::Debug for MetricsEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsEndpoint")
            .field("addr", &self.addr)
            .field("serving", &self.handle.is_some())
            .finish()
    }
}

/// Prometheus builder with conflux's latency buckets; sub-microsecond lock
/// waits are common, so the low end is finer than the exporter default.
fn exposition() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("seconds".to_string()), LATENCY_BUCKETS)
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "conflux_aggregate_contributions_total",
        "Contributions applied to shared aggregates"
    );
    describe_counter!(
        "conflux_aggregate_rejected_contributions_total",
        "Contributions rejected after finalization or cancellation"
    );
    describe_counter!(
        "conflux_aggregate_finalized_total",
        "Aggregates that passed their finalization barrier"
    );
    describe_histogram!(
        "conflux_aggregate_lock_wait_seconds",
        "Time contributors waited for the aggregate lock"
    );

    describe_counter!("conflux_multiplexer_rounds_total", "Dispatch rounds, by source");
    describe_counter!(
        "conflux_multiplexer_handler_failures_total",
        "Handler failures, by source"
    );
    describe_counter!(
        "conflux_multiplexer_source_failures_total",
        "Sources that failed while producing, by source"
    );
    describe_counter!(
        "conflux_multiplexer_sources_exhausted_total",
        "Sources that reached permanent exhaustion"
    );
    describe_histogram!(
        "conflux_multiplexer_handler_duration_seconds",
        "Time spent inside handlers"
    );
}

/// Shared aggregate metrics recorder.
pub struct AggregateMetrics;

impl AggregateMetrics {
    /// Record an applied contribution and how long it waited for the lock.
    pub fn record_contribution(lock_wait: Duration) {
        counter!("conflux_aggregate_contributions_total").increment(1);
        histogram!("conflux_aggregate_lock_wait_seconds").record(lock_wait.as_secs_f64());
    }

    /// Record a rejected contribution.
    pub fn record_rejection() {
        counter!("conflux_aggregate_rejected_contributions_total").increment(1);
    }

    /// Record an aggregate passing its finalization barrier.
    pub fn record_finalized() {
        counter!("conflux_aggregate_finalized_total").increment(1);
    }
}

/// Fan-in multiplexer metrics recorder.
pub struct MultiplexerMetrics;

impl MultiplexerMetrics {
    /// Record a completed dispatch round and its handler time.
    pub fn record_round(label: &Label, handler_time: Duration) {
        counter!("conflux_multiplexer_rounds_total", "source" => label.to_string()).increment(1);
        histogram!("conflux_multiplexer_handler_duration_seconds")
            .record(handler_time.as_secs_f64());
    }

    /// Record a handler failure.
    pub fn record_handler_failure(label: &Label) {
        counter!("conflux_multiplexer_handler_failures_total", "source" => label.to_string())
            .increment(1);
    }

    /// Record a source failing while producing.
    pub fn record_source_failure(label: &Label) {
        counter!("conflux_multiplexer_source_failures_total", "source" => label.to_string())
            .increment(1);
        counter!("conflux_multiplexer_rounds_total", "source" => label.to_string()).increment(1);
    }

    /// Record a source reaching exhaustion.
    pub fn record_exhausted() {
        counter!("conflux_multiplexer_sources_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value).to_string())
        }
    }

    #[test]
    fn test_unset_address_serves_nothing() {
        assert!(MetricsEndpoint::from_lookup(lookup(&[])).unwrap().is_none());
    }

    #[test]
    fn test_address_from_lookup() {
        let endpoint = MetricsEndpoint::from_lookup(lookup(&[(METRICS_ADDR_VAR, "127.0.0.1:9000")]))
            .unwrap()
            .unwrap();
        assert_eq!(endpoint.addr(), "127.0.0.1:9000".parse().unwrap());
        assert!(endpoint.render().is_none());
    }

    #[test]
    fn test_bad_address_rejected() {
        let result = MetricsEndpoint::from_lookup(lookup(&[(METRICS_ADDR_VAR, "localhost")]));
        assert!(matches!(result, Err(MetricsError::InvalidAddr { value, .. }) if value == "localhost"));
    }

    #[test]
    fn test_recorded_metrics_render() {
        let recorder = exposition().unwrap().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            register_metrics();
            AggregateMetrics::record_contribution(Duration::from_micros(20));
            AggregateMetrics::record_finalized();
            MultiplexerMetrics::record_round(&Label::new("chan1"), Duration::from_micros(5));
            MultiplexerMetrics::record_handler_failure(&Label::new("chan2"));
        });

        let rendered = handle.render();
        assert!(rendered.contains("conflux_aggregate_contributions_total 1"));
        assert!(rendered.contains("conflux_aggregate_finalized_total 1"));
        assert!(rendered.contains(r#"conflux_multiplexer_rounds_total{source="chan1"} 1"#));
        assert!(rendered.contains(r#"conflux_multiplexer_handler_failures_total{source="chan2"} 1"#));
        assert!(rendered.contains("conflux_aggregate_lock_wait_seconds_bucket"));
    }

    #[tokio::test]
    async fn test_endpoint_serves_over_http() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let mut endpoint = MetricsEndpoint::new(addr);
        endpoint.start().unwrap();
        AggregateMetrics::record_finalized();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
            .await
            .expect("metrics response timed out")
            .unwrap();

        assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
        assert!(response.contains("conflux_aggregate_finalized_total"));
        assert!(endpoint.render().is_some());

        // One recorder per process.
        let mut second = MetricsEndpoint::new(
            std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap(),
        );
        assert!(matches!(second.start(), Err(MetricsError::AlreadyInstalled)));
    }
}
