//! The retry engine: routing, arrival, tick, recovery and history queries.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::persistence::StateStore;
use crate::shard::{Admission, HISTORY_CAPACITY, SchedulerShard, ShardContext};
use crate::writer::CoalescingWriter;
use crate::{DeadLetter, HealthCheck, HealthReport};
use chrono::{DateTime, Utc};
use sms_retry_core::environment::{Clock, SystemClock};
use sms_retry_core::{
    MAX_ATTEMPTS, Message, MessageId, MessageRequest, MessageState, MessageSummary,
    ObjectStore, SendGateway, StateUpdate,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Capabilities the engine runs against.
#[derive(Clone)]
pub struct EngineEnvironment {
    /// Delivery transport
    pub gateway: Arc<dyn SendGateway>,
    /// Durable snapshot storage
    pub objects: Arc<dyn ObjectStore>,
    /// Time source for arrivals, due times and write keys
    pub clock: Arc<dyn Clock>,
}

impl EngineEnvironment {
    /// Environment on the system clock.
    #[must_use]
    pub fn new(gateway: Arc<dyn SendGateway>, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            gateway,
            objects,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Outcome of [`RetryEngine::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Pending messages re-seeded into their shards
    pub recovered: usize,
    /// Snapshots found under the pending prefix that are already terminal
    pub skipped_terminal: usize,
    /// Snapshots that could not be read, or claim to be pending with no attempts left
    pub malformed: usize,
}

/// Decrements the arrival counter when an inline attempt ends.
struct ArrivalGuard<'a>(&'a AtomicUsize);

impl Drop for ArrivalGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sharded retry scheduling engine.
///
/// Every message is owned by exactly one shard, chosen by a stable hash of
/// its identifier. The first attempt runs inline in [`new_message`]; later
/// attempts run on shard workers when [`wakeup`] finds them due.
///
/// [`new_message`]: Self::new_message
/// [`wakeup`]: Self::wakeup
pub struct RetryEngine {
    config: EngineConfig,
    shards: Vec<SchedulerShard>,
    writer: Arc<CoalescingWriter>,
    store: StateStore,
    clock: Arc<dyn Clock>,
    shutting_down: AtomicBool,
    arrivals_in_flight: AtomicUsize,
}

impl RetryEngine {
    /// Build the engine and start its shard workers and state writer.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if `config` does not validate.
    pub fn new(config: EngineConfig, environment: EngineEnvironment) -> Result<Self, EngineError> {
        config.validate()?;

        let EngineEnvironment {
            gateway,
            objects,
            clock,
        } = environment;

        let store = StateStore::new(objects);
        let writer = Arc::new(CoalescingWriter::new(
            config.writer.clone(),
            store.clone(),
            Arc::clone(&clock),
        ));
        writer.start();

        let context = ShardContext {
            gateway,
            writer: Arc::clone(&writer),
            clock: Arc::clone(&clock),
        };
        let shards = (0..config.shards)
            .map(|index| SchedulerShard::new(index, config.workers_per_shard, context.clone()))
            .collect();

        tracing::info!(
            shards = config.shards,
            workers_per_shard = config.workers_per_shard,
            writer_workers = config.writer.workers,
            "Retry engine started"
        );

        Ok(Self {
            config,
            shards,
            writer,
            store,
            clock,
            shutting_down: AtomicBool::new(false),
            arrivals_in_flight: AtomicUsize::new(0),
        })
    }

    /// Configuration the engine was built with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shard that owns `message_id`.
    ///
    /// A pure function of the identifier and the shard count.
    #[must_use]
    pub fn route_shard(&self, message_id: &MessageId) -> usize {
        message_id.bucket(self.shards.len())
    }

    fn shard_for(&self, message_id: &MessageId) -> &SchedulerShard {
        &self.shards[self.route_shard(message_id)]
    }

    /// Accept a message and run its first attempt inline.
    ///
    /// A blank or missing identifier is replaced by a generated one. If a
    /// pending message with the same identifier exists, nothing is sent and
    /// that identifier is returned. A terminal message with the same
    /// identifier is replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShutdownInProgress`] once shutdown has begun.
    pub async fn new_message(&self, request: MessageRequest) -> Result<MessageId, EngineError> {
        self.arrivals_in_flight.fetch_add(1, Ordering::SeqCst);
        let _arrival = ArrivalGuard(&self.arrivals_in_flight);
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(EngineError::ShutdownInProgress);
        }

        let now = self.clock.now();
        let id = request
            .supplied_id()
            .cloned()
            .unwrap_or_else(|| generate_id(now));
        let message = Message {
            id: id.clone(),
            destination: request.destination,
            body: request.body,
        };

        let shard = self.shard_for(&id);
        let mut state = match shard.admit(MessageState::new(message, now)) {
            Admission::Admitted(state) => state,
            Admission::Duplicate => {
                tracing::debug!(message_id = %id, "Message already pending, not re-sending");
                EngineMetrics::record_deduplicated();
                return Ok(id);
            },
        };

        EngineMetrics::record_accepted();
        let outcome = shard.attempt(&mut state, 1).await?;
        tracing::debug!(message_id = %id, shard = self.route_shard(&id), ?outcome, "First attempt done");
        Ok(id)
    }

    /// Dispatch every due retry on every shard.
    ///
    /// Returns without waiting for the attempts. Call it on every tick.
    /// Returns the number of entries dispatched.
    pub fn wakeup(&self) -> usize {
        let now = self.clock.now();
        self.shards
            .iter()
            .map(|shard| shard.drain_due_and_dispatch(now))
            .sum()
    }

    /// Re-seed shards from persisted pending snapshots.
    ///
    /// Call once at startup, before the first [`wakeup`](Self::wakeup).
    /// Terminal and malformed snapshots are skipped. A snapshot without a
    /// usable due time becomes due immediately.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the pending prefix cannot be listed.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let scan = self.store.load_pending().await?;
        let now = self.clock.now();
        let mut report = RecoveryReport {
            malformed: scan.malformed,
            ..RecoveryReport::default()
        };

        for mut state in scan.states {
            if !state.is_pending() {
                report.skipped_terminal += 1;
                continue;
            }
            if state.attempt_count >= MAX_ATTEMPTS {
                tracing::warn!(
                    message_id = %state.message_id,
                    attempt_count = state.attempt_count,
                    "Skipping pending snapshot with no attempts left"
                );
                report.malformed += 1;
                continue;
            }

            let due_at = state
                .next_due_at
                .filter(|due_at| due_at.timestamp_millis() > 0)
                .unwrap_or(now);
            state.next_due_at = Some(due_at);

            let id = state.message_id.clone();
            let shard = self.shard_for(&id);
            shard.upsert(state);
            shard.schedule(id, due_at);
            report.recovered += 1;
        }

        EngineMetrics::record_recovery(report.recovered, report.malformed);
        tracing::info!(
            recovered = report.recovered,
            skipped_terminal = report.skipped_terminal,
            malformed = report.malformed,
            "Recovery complete"
        );
        Ok(report)
    }

    /// Most recent successes across shards, newest first.
    ///
    /// `limit` is clamped to `1..=100`.
    #[must_use]
    pub fn recent_success(&self, limit: usize) -> Vec<MessageSummary> {
        self.recent(limit, SchedulerShard::snapshot_success)
    }

    /// Most recent failures across shards, newest first.
    ///
    /// `limit` is clamped to `1..=100`.
    #[must_use]
    pub fn recent_failed(&self, limit: usize) -> Vec<MessageSummary> {
        self.recent(limit, SchedulerShard::snapshot_failed)
    }

    fn recent(
        &self,
        limit: usize,
        snapshot: impl Fn(&SchedulerShard, usize) -> Vec<MessageState>,
    ) -> Vec<MessageSummary> {
        let limit = limit.clamp(1, HISTORY_CAPACITY);
        let mut merged: Vec<MessageState> = self
            .shards
            .iter()
            .flat_map(|shard| snapshot(shard, limit))
            .collect();

        merged.sort_by_key(|state| std::cmp::Reverse(state.recency()));
        merged.truncate(limit);
        merged.iter().map(MessageSummary::from).collect()
    }

    /// Point-in-time copy of a message's live state.
    pub async fn message_state(&self, message_id: &MessageId) -> Option<MessageState> {
        self.shard_for(message_id).state(message_id).await
    }

    /// Updates whose persistence failed after retries, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter<StateUpdate>> {
        self.writer.dead_letters()
    }

    /// Re-enqueue dead letters that have not been superseded.
    ///
    /// Returns the number re-enqueued.
    pub fn replay_dead_letters(&self) -> usize {
        self.writer.replay_dead_letters()
    }

    /// Current health of the scheduler and the state writer.
    ///
    /// The writer is degraded when dead letters exceed half their capacity
    /// or the backlog exceeds 80% of the queue, and unhealthy when the dead
    /// letter queue is full.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let live: usize = self.shards.iter().map(SchedulerShard::len).sum();
        let scheduled: usize = self.shards.iter().map(SchedulerShard::scheduled_len).sum();
        let in_flight = self.in_flight();
        let next_due = self.shards.iter().filter_map(SchedulerShard::next_due).min();

        let scheduler = if self.shutting_down.load(Ordering::Acquire) {
            HealthCheck::degraded("scheduler", "shutting down")
        } else {
            HealthCheck::healthy("scheduler")
        }
        .with_metadata("shards", self.shards.len())
        .with_metadata("live_messages", live)
        .with_metadata("scheduled", scheduled)
        .with_metadata("in_flight", in_flight)
        .with_metadata(
            "next_due_at",
            next_due.map_or_else(|| "none".to_string(), |due_at| due_at.to_rfc3339()),
        );

        let dead_letters = self.writer.dead_letter_queue();
        let dead = dead_letters.len();
        let backlog = self.writer.backlog();
        let capacity = self.writer.capacity();

        let writer = if dead_letters.is_full() {
            HealthCheck::unhealthy("state_writer", "dead letter queue full")
        } else if dead * 2 > dead_letters.max_size() {
            HealthCheck::degraded("state_writer", "dead letters above half capacity")
        } else if backlog * 5 > capacity * 4 {
            HealthCheck::degraded("state_writer", "write backlog above 80% of capacity")
        } else {
            HealthCheck::healthy("state_writer")
        }
        .with_metadata("backlog", backlog)
        .with_metadata("capacity", capacity)
        .with_metadata("dead_letters", dead);

        HealthReport::new(vec![scheduler, writer], self.clock.now())
    }

    /// Wait until no attempt is running, inline or on a shard worker.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] if attempts are still running after `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<(), EngineError> {
        if poll_until(timeout, || self.in_flight() == 0).await {
            Ok(())
        } else {
            Err(EngineError::Timeout("in-flight attempts"))
        }
    }

    /// Wait until the state writer has processed every accepted update.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] if updates are still queued after `timeout`.
    pub async fn flush(&self, timeout: Duration) -> Result<(), EngineError> {
        self.writer
            .flush(timeout)
            .await
            .map_err(|_| EngineError::Timeout("state writer flush"))
    }

    /// Stop accepting messages, finish running attempts and flush persistence.
    ///
    /// Due entries still in the index are not attempted; their pending
    /// snapshots are already persisted and recovery picks them up.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShutdownTimeout`] with the number of attempts and
    /// updates still outstanding if `timeout` expires.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), EngineError> {
        tracing::info!("Initiating graceful shutdown");
        self.shutting_down.store(true, Ordering::Release);
        let start = Instant::now();

        let arrivals = &self.arrivals_in_flight;
        if !poll_until(timeout, || arrivals.load(Ordering::SeqCst) == 0).await {
            return Err(EngineError::ShutdownTimeout(self.in_flight()));
        }

        let workers: Vec<_> = self.shards.iter().flat_map(SchedulerShard::close).collect();
        let remaining = timeout.saturating_sub(start.elapsed());
        if tokio::time::timeout(remaining, futures::future::join_all(workers))
            .await
            .is_err()
        {
            let pending = self.in_flight() + self.writer.backlog();
            tracing::error!(pending, "Shutdown timeout: retry workers still running");
            return Err(EngineError::ShutdownTimeout(pending));
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        self.writer.shutdown(remaining).await.map_err(|backlog| {
            tracing::error!(backlog, "Shutdown timeout: state writer still draining");
            EngineError::ShutdownTimeout(backlog)
        })?;

        tracing::info!(elapsed_ms = start.elapsed().as_millis(), "Shutdown complete");
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.arrivals_in_flight.load(Ordering::SeqCst)
            + self.shards.iter().map(SchedulerShard::in_flight).sum::<usize>()
    }
}

impl std::fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine")
            .field("config", &self.config)
            .field("writer", &self.writer)
            .finish_non_exhaustive()
    }
}

/// `msg-<epoch-millis>-<random hex>`
fn generate_id(now: DateTime<Utc>) -> MessageId {
    MessageId::new(format!(
        "msg-{}-{:x}",
        now.timestamp_millis(),
        rand::random::<u64>()
    ))
}

async fn poll_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if done() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(IDLE_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use sms_retry_testing::test_epoch;

    #[test]
    fn test_generated_id_format() {
        let id = generate_id(test_epoch());
        let parts: Vec<_> = id.as_str().splitn(3, '-').collect();

        assert_eq!(parts[0], "msg");
        assert_eq!(parts[1], "1735689600000");
        assert!(u64::from_str_radix(parts[2], 16).is_ok());
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(generate_id(test_epoch()), generate_id(test_epoch()));
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        assert!(!poll_until(Duration::from_millis(10), || false).await);
        assert!(poll_until(Duration::from_millis(10), || true).await);
    }
}
