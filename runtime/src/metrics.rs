//! Prometheus metrics for the retry engine and the state writer.
//!
//! All metrics go through the `metrics` facade, so recording is a no-op until
//! a recorder is installed. [`MetricsServer::start`] installs the Prometheus
//! recorder and serves it over HTTP.
//!
//! # Example
//!
//! ```rust,no_run
//! use sms_retry_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
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

    /// Install the Prometheus recorder and start the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built or
    /// the listener cannot bind.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a
    /// warning and leaves [`handle`](Self::handle) empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }
        register_metrics();

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::warn!("Metrics listener stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Engine
    describe_counter!(
        "sms_messages_accepted_total",
        "Messages accepted by new_message and given a first attempt"
    );
    describe_counter!(
        "sms_messages_deduplicated_total",
        "Arrivals that matched a still-pending message and were not re-sent"
    );
    describe_counter!(
        "sms_attempts_total",
        "Delivery attempts by outcome (sent, failed, error)"
    );
    describe_counter!(
        "sms_messages_finalized_total",
        "Messages that reached a terminal status, by status"
    );
    describe_counter!(
        "sms_retries_dispatched_total",
        "Due entries drained and handed to a shard worker pool"
    );
    describe_counter!(
        "sms_stale_entries_skipped_total",
        "Due entries dropped because the live state moved on"
    );
    describe_counter!(
        "sms_recovered_messages_total",
        "Pending messages re-seeded by recovery"
    );
    describe_counter!(
        "sms_recovery_malformed_total",
        "Persisted snapshots skipped by recovery as malformed"
    );

    // State writer
    describe_counter!(
        "state_writer_updates_enqueued_total",
        "State updates accepted into the writer queue"
    );
    describe_counter!(
        "state_writer_updates_dropped_total",
        "State updates shed because the writer queue was full"
    );
    describe_counter!(
        "state_writer_updates_coalesced_total",
        "Queued updates skipped because a later update for the same message was written"
    );
    describe_counter!(
        "state_writer_writes_total",
        "Object store writes completed by the state writer"
    );
    describe_counter!(
        "state_writer_write_errors_total",
        "Object store write attempts that failed"
    );
    describe_counter!(
        "state_writer_dead_letters_total",
        "State updates moved to the dead letter queue"
    );
    describe_histogram!(
        "state_writer_batch_size",
        "Distinct messages written per writer iteration"
    );
    describe_histogram!(
        "state_writer_put_duration_seconds",
        "Time taken to persist one state update, retries included"
    );

    // Dead letter queue
    describe_gauge!("dlq_size", "Entries currently held in the dead letter queue");
    describe_counter!("dlq_pushed", "Entries pushed to the dead letter queue");
    describe_counter!(
        "dlq_dropped",
        "Oldest entries evicted because the dead letter queue was full"
    );
    describe_counter!("dlq_drained", "Entries drained from the dead letter queue");
}

/// Engine metrics recorder.
pub struct EngineMetrics;

impl EngineMetrics {
    /// Record an accepted arrival.
    pub fn record_accepted() {
        counter!("sms_messages_accepted_total").increment(1);
    }

    /// Record an arrival that matched a pending message.
    pub fn record_deduplicated() {
        counter!("sms_messages_deduplicated_total").increment(1);
    }

    /// Record one delivery attempt.
    ///
    /// `outcome` is `sent`, `failed` or `error`.
    pub fn record_attempt(outcome: &'static str) {
        counter!("sms_attempts_total", "outcome" => outcome).increment(1);
    }

    /// Record a terminal status.
    pub fn record_finalized(status: &'static str) {
        counter!("sms_messages_finalized_total", "status" => status).increment(1);
    }

    /// Record due entries handed to a worker pool.
    pub fn record_dispatched(count: usize) {
        counter!("sms_retries_dispatched_total").increment(count as u64);
    }

    /// Record a dropped stale entry.
    pub fn record_stale() {
        counter!("sms_stale_entries_skipped_total").increment(1);
    }

    /// Record a recovery pass.
    pub fn record_recovery(recovered: usize, malformed: usize) {
        counter!("sms_recovered_messages_total").increment(recovered as u64);
        counter!("sms_recovery_malformed_total").increment(malformed as u64);
    }
}

/// State writer metrics recorder.
pub struct WriterMetrics;

impl WriterMetrics {
    /// Record an update accepted into the queue.
    pub fn record_enqueued() {
        counter!("state_writer_updates_enqueued_total").increment(1);
    }

    /// Record an update shed on a full queue.
    pub fn record_dropped() {
        counter!("state_writer_updates_dropped_total").increment(1);
    }

    /// Record queued updates that were superseded before being written.
    pub fn record_coalesced(count: usize) {
        if count > 0 {
            counter!("state_writer_updates_coalesced_total").increment(count as u64);
        }
    }

    /// Record the number of distinct messages written in one iteration.
    #[allow(clippy::cast_precision_loss)] // batch sizes are far below 2^53
    pub fn record_batch(size: usize) {
        histogram!("state_writer_batch_size").record(size as f64);
    }

    /// Record a completed write.
    pub fn record_write(duration: Duration) {
        counter!("state_writer_writes_total").increment(1);
        histogram!("state_writer_put_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed write attempt.
    pub fn record_write_error() {
        counter!("state_writer_write_errors_total").increment(1);
    }

    /// Record an update moved to the dead letter queue.
    pub fn record_dead_letter() {
        counter!("state_writer_dead_letters_total").increment(1);
    }
}
