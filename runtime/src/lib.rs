//! # SMS Retry Runtime
//!
//! Sharded retry scheduling engine for message delivery.
//!
//! This crate runs the retry lifecycle defined in `sms-retry-core`: it owns
//! live message state, drives attempts from a due-time index on every tick,
//! persists snapshots asynchronously and recovers pending work after a restart.
//!
//! ## Core Components
//!
//! - **[`RetryEngine`]**: routes messages to shards, runs the first attempt
//!   inline, drains shards on `wakeup`, recovers from storage, answers history queries
//! - **Scheduler shard**: state table, due-time index, worker pool and
//!   bounded outcome history for one partition of identifiers
//! - **[`CoalescingWriter`]**: bounded, de-duplicating persistence pipeline with
//!   write retries and a dead letter queue
//! - **Adapters**: [`FileSystemObjectStore`], [`RandomSendGateway`], [`HttpSendGateway`]
//!
//! ## Example
//!
//! ```ignore
//! use sms_retry_runtime::{EngineConfig, EngineEnvironment, RetryEngine};
//! use sms_retry_core::MessageRequest;
//!
//! let engine = RetryEngine::new(EngineConfig::default(), environment)?;
//! engine.recover().await?;
//!
//! let id = engine.new_message(MessageRequest::new("+15550100", "hello")).await?;
//!
//! // Every 500 ms
//! engine.wakeup();
//! ```

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Engine and writer configuration
pub mod config;

/// Due-time min-heap
pub mod due_index;

/// The retry engine
pub mod engine;

/// Local filesystem object store
pub mod fs_store;

/// Delivery gateway implementations
pub mod gateway;

/// Prometheus metrics for observability
pub mod metrics;

/// Snapshot keys, encoding and recovery scan
pub mod persistence;

/// Bounded exponential backoff for persistence writes
pub mod retry;

mod shard;

/// Coalescing state writer
pub mod writer;

/// Error types for the engine
pub mod error {
    use crate::config::ConfigError;
    use crate::persistence::PersistenceError;
    use sms_retry_core::BackoffError;
    use thiserror::Error;

    /// Errors that can occur during engine operations
    #[derive(Error, Debug)]
    pub enum EngineError {
        /// An attempt number fell outside the backoff table
        ///
        /// Indicates a logic error or corrupted state, never a delivery failure.
        #[error("Backoff policy violated: {0}")]
        Backoff(#[from] BackoffError),

        /// Snapshot storage failed
        #[error("Persistence failed: {0}")]
        Persistence(#[from] PersistenceError),

        /// Configuration rejected
        #[error("Invalid configuration: {0}")]
        Config(#[from] ConfigError),

        /// Engine is shutting down and not accepting new messages
        #[error("Engine is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for work to complete
        #[error("Shutdown timed out with {0} operations still pending")]
        ShutdownTimeout(usize),

        /// A wait for idleness or flush timed out
        #[error("Timed out waiting for {0}")]
        Timeout(&'static str),
    }
}

pub use config::{ConfigError, EngineConfig, WriterConfig};
pub use due_index::{DueIndex, ScheduledEntry};
pub use engine::{EngineEnvironment, RecoveryReport, RetryEngine};
pub use error::EngineError;
pub use fs_store::FileSystemObjectStore;
pub use gateway::{HttpSendGateway, RandomSendGateway};
pub use persistence::{PersistenceError, StateStore};
pub use retry::RetryPolicy;
pub use writer::CoalescingWriter;

/// Health check status levels
///
/// Indicates the current health state of a component or system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is operational but experiencing issues (e.g., high DLQ size)
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is degraded
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check result for a component
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    pub message: Option<String>,

    /// Metadata such as queue depths and counts
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Create a degraded check result
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.push((key.into(), value.to_string()));
        self
    }

    /// Look up a metadata value
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Aggregated health report
///
/// Combines multiple health checks into an overall system status.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall system status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// When the report was generated
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Create a new health report from checks
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>, timestamp: DateTime<Utc>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp,
        }
    }

    /// Check if overall system is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Find the check for a component
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }
}

/// Dead letter queue entry
///
/// An operation that failed after exhausting its retries.
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    /// The failed operation payload
    pub payload: T,

    /// Number of retries performed before giving up
    pub retry_count: usize,

    /// The error message from the last failure
    pub error_message: String,

    /// When the operation was given up on
    pub failed_at: DateTime<Utc>,
}

/// Dead Letter Queue for storing failed operations
///
/// # Features
///
/// - Bounded queue with configurable max size
/// - FIFO ordering (oldest entries dropped when full)
/// - Thread-safe for concurrent access
/// - Metrics tracking for queue size and operations
///
/// # Example
///
/// ```
/// use sms_retry_runtime::DeadLetterQueue;
/// use chrono::Utc;
///
/// let dlq = DeadLetterQueue::new(2);
/// dlq.push("a", "timeout".to_string(), 3, Utc::now());
/// dlq.push("b", "timeout".to_string(), 3, Utc::now());
/// dlq.push("c", "timeout".to_string(), 3, Utc::now());
///
/// // Oldest entry was evicted
/// let payloads: Vec<_> = dlq.drain().into_iter().map(|e| e.payload).collect();
/// assert_eq!(payloads, vec!["b", "c"]);
/// ```
#[derive(Debug)]
pub struct DeadLetterQueue<T> {
    /// The queue storage
    queue: Arc<Mutex<VecDeque<DeadLetter<T>>>>,

    /// Maximum queue size
    max_size: usize,
}

impl<T> DeadLetterQueue<T> {
    /// Create a new dead letter queue holding at most `max_size` entries
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size: max_size.max(1),
        }
    }

    /// Push a failed operation onto the queue
    ///
    /// If the queue is full, the oldest entry is dropped.
    pub fn push(
        &self,
        payload: T,
        error_message: String,
        retry_count: usize,
        failed_at: DateTime<Utc>,
    ) {
        let mut queue = self.lock();

        if queue.len() >= self.max_size {
            queue.pop_front();
            metrics::counter!("dlq_dropped").increment(1);
            tracing::warn!(
                max_size = self.max_size,
                "DLQ at capacity, dropping oldest entry"
            );
        }

        queue.push_back(DeadLetter {
            payload,
            retry_count,
            error_message,
            failed_at,
        });

        #[allow(clippy::cast_precision_loss)] // bounded by max_size
        metrics::gauge!("dlq_size").set(queue.len() as f64);
        metrics::counter!("dlq_pushed").increment(1);
    }

    /// Get the current queue size
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the next push would evict an entry
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.max_size
    }

    /// Drain all entries from the queue, oldest first
    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        let entries: Vec<_> = self.lock().drain(..).collect();

        metrics::gauge!("dlq_size").set(0.0);
        metrics::counter!("dlq_drained").increment(entries.len() as u64);
        tracing::info!(count = entries.len(), "Drained dead letter queue");

        entries
    }

    /// Copy of all entries, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeadLetter<T>>
    where
        T: Clone,
    {
        self.lock().iter().cloned().collect()
    }

    /// Get the maximum queue size
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeadLetter<T>>> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T> Clone for DeadLetterQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            max_size: self.max_size,
        }
    }
}

impl<T> Default for DeadLetterQueue<T> {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn test_health_status_worst() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Unhealthy.worst(HealthStatus::Degraded),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Healthy),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn test_health_report_takes_worst_check() {
        let report = HealthReport::new(
            vec![
                HealthCheck::healthy("scheduler").with_metadata("shards", 16),
                HealthCheck::degraded("state_writer", "backlog high"),
            ],
            Utc::now(),
        );

        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.is_healthy());
        assert_eq!(
            report.check("scheduler").and_then(|c| c.metadata_value("shards")),
            Some("16")
        );
    }

    #[test]
    fn test_dlq_evicts_oldest_when_full() {
        let dlq = DeadLetterQueue::new(2);
        let now = Utc::now();
        dlq.push(1, "e".to_string(), 3, now);
        dlq.push(2, "e".to_string(), 3, now);
        assert!(dlq.is_full());

        dlq.push(3, "e".to_string(), 3, now);

        let payloads: Vec<_> = dlq.snapshot().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![2, 3]);
        assert_eq!(dlq.len(), 2);
    }

    #[test]
    fn test_dlq_drain_empties_queue_and_clones_share_storage() {
        let dlq = DeadLetterQueue::new(10);
        let handle = dlq.clone();
        handle.push("x", "boom".to_string(), 1, Utc::now());

        let drained = dlq.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].error_message, "boom");
        assert!(handle.is_empty());
    }
}
