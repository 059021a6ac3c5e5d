//! Engine and writer configuration.
//!
//! Loads from environment variables with sensible defaults, or is built in
//! code with the `with_*` methods.

use crate::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A count or size that must be at least 1 was 0.
    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

/// Coalescing writer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterConfig {
    /// Total capacity of the update queue across all writer workers
    pub queue_capacity: usize,
    /// Additional updates drained after the first one in each iteration
    pub batch_size: usize,
    /// Number of writer workers
    pub workers: usize,
    /// Retry policy for each object store write
    pub retry_policy: RetryPolicy,
    /// Maximum number of dead letters kept
    pub dlq_capacity: usize,
}

impl WriterConfig {
    /// Set the queue capacity
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the batch size
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the number of writer workers
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the write retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the dead letter capacity
    #[must_use]
    pub const fn with_dlq_capacity(mut self, capacity: usize) -> Self {
        self.dlq_capacity = capacity;
        self
    }

    /// Load from `SMS_WRITER_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_capacity: env_or("SMS_WRITER_QUEUE_CAPACITY", defaults.queue_capacity),
            batch_size: env_or("SMS_WRITER_BATCH_SIZE", defaults.batch_size),
            workers: env_or("SMS_WRITER_WORKERS", defaults.workers),
            retry_policy: defaults.retry_policy,
            dlq_capacity: env_or("SMS_WRITER_DLQ_CAPACITY", defaults.dlq_capacity),
        }
    }

    /// Reject zero sizes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] naming the first offending field.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("writer queue capacity"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("writer batch size"));
        }
        if self.workers == 0 {
            return Err(ConfigError::Zero("writer workers"));
        }
        if self.dlq_capacity == 0 {
            return Err(ConfigError::Zero("dead letter capacity"));
        }
        Ok(())
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 200_000,
            batch_size: 2_000,
            workers: 2,
            retry_policy: RetryPolicy::default(),
            dlq_capacity: 10_000,
        }
    }
}

/// Retry engine configuration.
///
/// # Example
///
/// ```
/// use sms_retry_runtime::config::{EngineConfig, WriterConfig};
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_shards(4)
///     .with_workers_per_shard(1)
///     .with_writer(WriterConfig::default().with_workers(1));
///
/// assert_eq!(config.tick_interval, Duration::from_millis(500));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Number of scheduler shards
    pub shards: usize,
    /// Retry workers per shard
    pub workers_per_shard: usize,
    /// Interval at which the host should call `wakeup`
    pub tick_interval: Duration,
    /// Coalescing writer settings
    pub writer: WriterConfig,
}

impl EngineConfig {
    /// Set the shard count
    #[must_use]
    pub const fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set the retry workers per shard
    #[must_use]
    pub const fn with_workers_per_shard(mut self, workers: usize) -> Self {
        self.workers_per_shard = workers;
        self
    }

    /// Set the tick interval
    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the writer configuration
    #[must_use]
    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            shards: env_or("SMS_SCHEDULER_SHARDS", defaults.shards),
            workers_per_shard: env_or("SMS_RETRY_THREADS_PER_SHARD", defaults.workers_per_shard),
            tick_interval: Duration::from_millis(env_or(
                "SMS_TICK_INTERVAL_MS",
                u64::try_from(defaults.tick_interval.as_millis()).unwrap_or(500),
            )),
            writer: WriterConfig::from_env(),
        }
    }

    /// Reject zero counts and intervals.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] naming the first offending field.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.shards == 0 {
            return Err(ConfigError::Zero("shard count"));
        }
        if self.workers_per_shard == 0 {
            return Err(ConfigError::Zero("workers per shard"));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Zero("tick interval"));
        }
        self.writer.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            workers_per_shard: 2,
            tick_interval: Duration::from_millis(500),
            writer: WriterConfig::default(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}
