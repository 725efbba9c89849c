//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the outbox components:
//! - Event bus publishes (per delivery mode)
//! - Outbox processor cycles, deliveries, failures and terminal failures
//! - Bookkeeping retries
//!
//! # Example
//!
//! ```rust,no_run
//! use composable_outbox_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.serve()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder without an HTTP listener.
    ///
    /// Metrics can then be rendered with [`MetricsServer::render`].
    ///
    /// # Errors
    ///
    /// Returns error if the metrics exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a
    /// warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        match builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Install the recorder and serve `/metrics` on the configured address.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or the listener cannot be installed.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        builder()?
            .with_http_listener(self.addr)
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder wasn't installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        // Configure histogram buckets for latency measurements
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Register all metric descriptions.
fn register_metrics() {
    // Event Bus Metrics
    describe_counter!(
        "outbox_bus_published_total",
        "Total number of events published through the event bus, by mode"
    );
    describe_counter!(
        "outbox_bus_immediate_errors_total",
        "Total number of immediate (in-process) delivery errors on publish"
    );
    describe_counter!(
        "outbox_events_saved_total",
        "Total number of events persisted to the outbox"
    );

    // Processor Metrics
    describe_counter!(
        "outbox_events_published_total",
        "Total number of outbox events delivered and marked published"
    );
    describe_counter!(
        "outbox_events_failed_total",
        "Total number of failed delivery attempts"
    );
    describe_counter!(
        "outbox_events_terminally_failed_total",
        "Total number of events that exhausted their retry budget"
    );
    describe_counter!(
        "outbox_fetch_errors_total",
        "Total number of failed polls of the event store"
    );
    describe_counter!(
        "outbox_bookkeeping_errors_total",
        "Total number of mark-published / mark-failed writes that could not be stored"
    );
    describe_histogram!(
        "outbox_cycle_duration_seconds",
        "Time taken by one fetch + deliver cycle"
    );
    describe_histogram!(
        "outbox_delivery_duration_seconds",
        "Time taken to deliver one event"
    );
    describe_gauge!(
        "outbox_batch_size",
        "Number of events fetched in the last cycle"
    );

    // Retry Metrics
    describe_counter!(
        "retry_attempts_total",
        "Total number of retry attempts"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of retry attempts that exhausted max retries"
    );
}

/// Event bus metrics recorder.
pub struct EventBusMetrics;

impl EventBusMetrics {
    /// Record a publish in the given mode.
    pub fn record_publish(mode: &'static str) {
        counter!("outbox_bus_published_total", "mode" => mode).increment(1);
    }

    /// Record a failed immediate delivery.
    pub fn record_immediate_error() {
        counter!("outbox_bus_immediate_errors_total").increment(1);
    }

    /// Record events persisted to the outbox.
    pub fn record_saved(count: usize) {
        counter!("outbox_events_saved_total").increment(count as u64);
    }
}

/// Outbox processor metrics recorder.
pub struct ProcessorMetrics;

impl ProcessorMetrics {
    /// Record a completed cycle.
    #[allow(clippy::cast_precision_loss)] // Batch sizes are far below f64 precision limits
    pub fn record_cycle(fetched: usize, duration: Duration) {
        gauge!("outbox_batch_size").set(fetched as f64);
        histogram!("outbox_cycle_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a successful delivery.
    pub fn record_published(event_type: &str, duration: Duration) {
        counter!("outbox_events_published_total", "event_type" => event_type.to_string())
            .increment(1);
        histogram!("outbox_delivery_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed attempt.
    pub fn record_failed(event_type: &str) {
        counter!("outbox_events_failed_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    /// Record a terminal failure.
    pub fn record_terminal_failure(event_type: &str) {
        counter!("outbox_events_terminally_failed_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    /// Record a failed poll.
    pub fn record_fetch_error() {
        counter!("outbox_fetch_errors_total").increment(1);
    }

    /// Record claimed events left for a later cycle.
    pub fn record_deferred(count: usize) {
        counter!("outbox_events_deferred_total").increment(count as u64);
    }

    /// Record a bookkeeping write that was given up on.
    pub fn record_bookkeeping_error() {
        counter!("outbox_bookkeeping_errors_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}
