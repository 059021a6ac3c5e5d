//! Scheduler shard: owns one partition of messages.
//!
//! A shard holds the live state of its messages, a due-time index, a fixed
//! pool of retry workers and the recent terminal outcomes. Each state sits
//! behind its own async mutex that is held for the whole of an attempt, so
//! attempts for one message are strictly sequential while different messages
//! proceed in parallel.

use crate::due_index::{DueIndex, ScheduledEntry};
use crate::metrics::EngineMetrics;
use crate::writer::CoalescingWriter;
use chrono::{DateTime, Utc};
use sms_retry_core::environment::Clock;
use sms_retry_core::{
    AttemptOutcome, BackoffError, MAX_ATTEMPTS, MessageId, MessageState, MessageStatus,
    SendError, SendGateway, StateUpdate,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Terminal outcomes kept per shard and per status.
pub(crate) const HISTORY_CAPACITY: usize = 100;

type StateSlot = Arc<AsyncMutex<MessageState>>;

/// Result of offering a fresh arrival to a shard.
pub(crate) enum Admission {
    /// Stored; the caller holds the state lock and runs attempt 1.
    Admitted(OwnedMutexGuard<MessageState>),
    /// A pending state for the identifier already exists.
    Duplicate,
}

/// Collaborators shared by every shard.
#[derive(Clone)]
pub(crate) struct ShardContext {
    pub(crate) gateway: Arc<dyn SendGateway>,
    pub(crate) writer: Arc<CoalescingWriter>,
    pub(crate) clock: Arc<dyn Clock>,
}

/// Newest-first buffers of terminal states.
#[derive(Debug, Default)]
struct RecentOutcomes {
    success: VecDeque<MessageState>,
    failed: VecDeque<MessageState>,
}

impl RecentOutcomes {
    fn record(&mut self, state: MessageState) {
        let buffer = match state.status {
            MessageStatus::Success => &mut self.success,
            MessageStatus::Failed => &mut self.failed,
            MessageStatus::Pending => return,
        };
        buffer.push_front(state);
        buffer.truncate(HISTORY_CAPACITY);
    }
}

pub(crate) struct SchedulerShard {
    inner: Arc<ShardInner>,
    dispatch: RwLock<Option<UnboundedSender<ScheduledEntry>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct ShardInner {
    index: usize,
    states: RwLock<HashMap<MessageId, StateSlot>>,
    due: DueIndex,
    history: Mutex<RecentOutcomes>,
    in_flight: AtomicUsize,
    context: ShardContext,
}

/// Decrements the in-flight counter when a retry task ends.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SchedulerShard {
    /// Create a shard and spawn its `workers` retry workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn new(index: usize, workers: usize, context: ShardContext) -> Self {
        let inner = Arc::new(ShardInner {
            index,
            states: RwLock::new(HashMap::new()),
            due: DueIndex::new(),
            history: Mutex::new(RecentOutcomes::default()),
            in_flight: AtomicUsize::new(0),
            context,
        });

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let handles = (0..workers.max(1))
            .map(|_| tokio::spawn(Arc::clone(&inner).work(Arc::clone(&receiver))))
            .collect();

        Self {
            inner,
            dispatch: RwLock::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// Store a fresh state unless a pending one exists for its identifier.
    ///
    /// A state whose lock is held counts as pending: an attempt is running
    /// on it. A terminal state is replaced.
    pub(crate) fn admit(&self, state: MessageState) -> Admission {
        let mut states = write(&self.inner.states);

        if let Some(existing) = states.get(&state.message_id) {
            let finished = existing
                .try_lock()
                .is_ok_and(|current| !current.is_pending());
            if !finished {
                return Admission::Duplicate;
            }
        }

        let id = state.message_id.clone();
        let slot = Arc::new(AsyncMutex::new(state));
        // Nobody else can see the slot yet, so locking it cannot fail
        let Ok(guard) = Arc::clone(&slot).try_lock_owned() else {
            return Admission::Duplicate;
        };
        states.insert(id, slot);
        Admission::Admitted(guard)
    }

    /// Replace or insert the live state.
    pub(crate) fn upsert(&self, state: MessageState) {
        let id = state.message_id.clone();
        write(&self.inner.states).insert(id, Arc::new(AsyncMutex::new(state)));
    }

    /// Register a due entry.
    pub(crate) fn schedule(&self, message_id: MessageId, due_at: DateTime<Utc>) {
        self.inner.due.insert(ScheduledEntry::new(message_id, due_at));
    }

    /// Hand every entry due at `now` to the worker pool.
    ///
    /// Never waits on an attempt. Returns the number of entries dispatched.
    pub(crate) fn drain_due_and_dispatch(&self, now: DateTime<Utc>) -> usize {
        let dispatch = self
            .dispatch
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(sender) = dispatch.as_ref() else {
            return 0;
        };

        let due = self.inner.due.drain_due(now);
        let mut dispatched = 0;
        for entry in due {
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
            if let Err(mpsc::error::SendError(entry)) = sender.send(entry) {
                self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                // Pool is gone; keep the entry for a later drain
                self.inner.due.insert(entry);
                break;
            }
            dispatched += 1;
        }

        if dispatched > 0 {
            tracing::debug!(shard = self.inner.index, dispatched, "Dispatched due retries");
            EngineMetrics::record_dispatched(dispatched);
        }
        dispatched
    }

    /// Run `attempt` on a state the caller has locked.
    pub(crate) async fn attempt(
        &self,
        state: &mut MessageState,
        attempt: u32,
    ) -> Result<AttemptOutcome, BackoffError> {
        self.inner.attempt(state, attempt).await
    }

    /// Up to `limit` most recent successes, newest first.
    pub(crate) fn snapshot_success(&self, limit: usize) -> Vec<MessageState> {
        let history = lock(&self.inner.history);
        history.success.iter().take(limit).cloned().collect()
    }

    /// Up to `limit` most recent failures, newest first.
    pub(crate) fn snapshot_failed(&self, limit: usize) -> Vec<MessageState> {
        let history = lock(&self.inner.history);
        history.failed.iter().take(limit).cloned().collect()
    }

    /// Point-in-time copy of the live state.
    ///
    /// Waits for an attempt in progress on that message to finish.
    pub(crate) async fn state(&self, message_id: &MessageId) -> Option<MessageState> {
        let slot = self.inner.slot(message_id)?;
        let state = slot.lock().await;
        Some(state.clone())
    }

    /// Number of live states, terminal ones included.
    pub(crate) fn len(&self) -> usize {
        read(&self.inner.states).len()
    }

    /// Dispatched retry tasks that have not finished.
    pub(crate) fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Registered due entries, stale ones included.
    pub(crate) fn scheduled_len(&self) -> usize {
        self.inner.due.len()
    }

    /// Earliest registered due time, stale entries included.
    pub(crate) fn next_due(&self) -> Option<DateTime<Utc>> {
        self.inner.due.next_due()
    }

    /// Stop accepting dispatches; workers exit once their queue is empty.
    pub(crate) fn close(&self) -> Vec<JoinHandle<()>> {
        self.dispatch
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        lock(&self.workers).drain(..).collect()
    }
}

impl ShardInner {
    fn slot(&self, message_id: &MessageId) -> Option<StateSlot> {
        read(&self.states).get(message_id).cloned()
    }

    async fn work(self: Arc<Self>, receiver: Arc<AsyncMutex<UnboundedReceiver<ScheduledEntry>>>) {
        loop {
            let next = receiver.lock().await.recv().await;
            let Some(entry) = next else {
                break;
            };
            let _guard = InFlightGuard(&self.in_flight);
            self.process_due(entry).await;
        }
        tracing::debug!(shard = self.index, "Retry worker exiting");
    }

    /// Retry task for one drained entry.
    async fn process_due(&self, entry: ScheduledEntry) {
        let Some(slot) = self.slot(&entry.message_id) else {
            tracing::debug!(shard = self.index, message_id = %entry.message_id, "No state for due entry");
            return;
        };
        let mut state = slot.lock().await;

        if !state.is_pending() {
            tracing::debug!(message_id = %entry.message_id, status = %state.status, "Skipping finished message");
            EngineMetrics::record_stale();
            return;
        }

        let now = self.context.clock.now();
        if let Some(due_at) = state.next_due_at.filter(|due_at| *due_at > now) {
            if entry.due_at == due_at {
                // Drained early by a clock step; put it back
                self.due.insert(entry);
            } else {
                tracing::debug!(message_id = %entry.message_id, "Dropping stale due entry");
                EngineMetrics::record_stale();
            }
            return;
        }

        let attempt = state.attempt_count + 1;
        if attempt > MAX_ATTEMPTS {
            tracing::debug!(message_id = %entry.message_id, attempt, "No attempts left");
            return;
        }

        if let Err(err) = self.attempt(&mut state, attempt).await {
            tracing::error!(
                shard = self.index,
                message_id = %entry.message_id,
                attempt,
                error = %err,
                "Retry task rejected by backoff policy"
            );
        }
    }

    /// Send, apply the result, then persist and schedule as the outcome requires.
    async fn attempt(
        &self,
        state: &mut MessageState,
        attempt: u32,
    ) -> Result<AttemptOutcome, BackoffError> {
        sms_retry_core::backoff::delay_from_arrival(attempt)?;

        let message = state.to_message();
        let result = self.context.gateway.send(&message).await;
        EngineMetrics::record_attempt(attempt_label(&result));
        if let Err(err) = &result {
            tracing::debug!(message_id = %message.id, attempt, error = %err, "Gateway error");
        }

        let outcome = state.apply_attempt(attempt, result, self.context.clock.now())?;
        match outcome {
            AttemptOutcome::Delivered | AttemptOutcome::Exhausted => {
                tracing::debug!(
                    message_id = %message.id,
                    attempt,
                    status = %state.status,
                    "Message finalized"
                );
                EngineMetrics::record_finalized(state.status.as_str());
                self.context.writer.enqueue(StateUpdate::of(state));
                self.record_terminal(state.clone());
            },
            AttemptOutcome::Rescheduled { due_at } => {
                tracing::debug!(message_id = %message.id, attempt, %due_at, "Attempt failed, rescheduled");
                self.context.writer.enqueue(StateUpdate::pending(state));
                self.due.insert(ScheduledEntry::new(message.id, due_at));
            },
        }
        Ok(outcome)
    }

    /// Push a terminal snapshot to the front of its history buffer.
    fn record_terminal(&self, state: MessageState) {
        lock(&self.history).record(state);
    }
}

const fn attempt_label(result: &Result<bool, SendError>) -> &'static str {
    match result {
        Ok(true) => "sent",
        Ok(false) => "failed",
        Err(_) => "error",
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::config::WriterConfig;
    use crate::persistence::StateStore;
    use proptest::prelude::*;
    use sms_retry_core::{Message, MessageStatus};
    use sms_retry_testing::{InMemoryObjectStore, ManualClock, ScriptedGateway, test_epoch};

    fn state(id: &str) -> MessageState {
        MessageState::new(
            Message {
                id: MessageId::new(id),
                destination: "+15550100".to_string(),
                body: "hello".to_string(),
            },
            test_epoch(),
        )
    }

    fn terminal(id: &str, status: MessageStatus, offset_ms: i64) -> MessageState {
        let mut state = state(id);
        state.status = status;
        state.attempt_count = 1;
        state.finalized_at = Some(test_epoch() + chrono::Duration::milliseconds(offset_ms));
        state
    }

    fn shard(gateway: ScriptedGateway, clock: ManualClock) -> SchedulerShard {
        let objects = Arc::new(InMemoryObjectStore::new());
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let writer = Arc::new(CoalescingWriter::new(
            WriterConfig::default(),
            StateStore::new(objects),
            Arc::clone(&clock),
        ));
        SchedulerShard::new(
            0,
            1,
            ShardContext {
                gateway: Arc::new(gateway),
                writer,
                clock,
            },
        )
    }

    #[test]
    fn test_history_is_bounded_and_newest_first() {
        let mut history = RecentOutcomes::default();
        for i in 0..150 {
            history.record(terminal(&format!("m{i}"), MessageStatus::Success, i));
        }
        history.record(terminal("pending", MessageStatus::Pending, 0));

        assert_eq!(history.success.len(), HISTORY_CAPACITY);
        assert_eq!(history.success[0].message_id.as_str(), "m149");
        assert!(history.failed.is_empty());
    }

    #[tokio::test]
    async fn test_admit_rejects_pending_and_replaces_terminal() {
        let shard = shard(ScriptedGateway::accepting(), ManualClock::at_test_epoch());

        let first = shard.admit(state("a"));
        assert!(matches!(first, Admission::Admitted(_)));
        // Locked by the arrival in progress
        assert!(matches!(shard.admit(state("a")), Admission::Duplicate));
        drop(first);

        // Still pending after the lock is released
        assert!(matches!(shard.admit(state("a")), Admission::Duplicate));

        shard.upsert(terminal("a", MessageStatus::Success, 10));
        assert!(matches!(shard.admit(state("a")), Admission::Admitted(_)));
        assert_eq!(shard.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_respects_limit() {
        let shard = shard(ScriptedGateway::accepting(), ManualClock::at_test_epoch());
        for i in 0..5 {
            shard.inner.record_terminal(terminal(&format!("f{i}"), MessageStatus::Failed, i));
        }

        let failed = shard.snapshot_failed(3);
        let ids: Vec<_> = failed.iter().map(|s| s.message_id.as_str()).collect();
        assert_eq!(ids, vec!["f4", "f3", "f2"]);
        assert!(shard.snapshot_success(3).is_empty());
    }

    #[tokio::test]
    async fn test_early_entry_is_put_back() {
        let clock = ManualClock::at_test_epoch();
        let gateway = ScriptedGateway::rejecting();
        let shard = shard(gateway.clone(), clock.clone());

        let mut pending = state("a");
        pending.attempt_count = 1;
        let due_at = test_epoch() + chrono::Duration::milliseconds(500);
        pending.next_due_at = Some(due_at);
        shard.upsert(pending);

        // Reaches the worker before its due time
        shard.inner.process_due(ScheduledEntry::new(MessageId::new("a"), due_at)).await;

        assert_eq!(gateway.total_calls(), 0);
        assert_eq!(shard.scheduled_len(), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_is_dropped() {
        let clock = ManualClock::at_test_epoch();
        let gateway = ScriptedGateway::rejecting();
        let shard = shard(gateway.clone(), clock.clone());

        let mut pending = state("a");
        pending.attempt_count = 2;
        pending.next_due_at = Some(test_epoch() + chrono::Duration::milliseconds(2_000));
        shard.upsert(pending);

        let superseded = ScheduledEntry::new(MessageId::new("a"), test_epoch());
        shard.inner.process_due(superseded).await;

        assert_eq!(gateway.total_calls(), 0);
        assert_eq!(shard.scheduled_len(), 0);
    }

    #[tokio::test]
    async fn test_due_entry_runs_next_attempt_and_reschedules() {
        let clock = ManualClock::at_test_epoch();
        let gateway = ScriptedGateway::rejecting();
        let shard = shard(gateway.clone(), clock.clone());

        let mut pending = state("a");
        pending.attempt_count = 1;
        let due_at = test_epoch() + chrono::Duration::milliseconds(500);
        pending.next_due_at = Some(due_at);
        shard.upsert(pending);
        clock.advance_millis(500);

        shard.inner.process_due(ScheduledEntry::new(MessageId::new("a"), due_at)).await;

        let live = shard.state(&MessageId::new("a")).await.unwrap();
        assert_eq!(live.attempt_count, 2);
        assert_eq!(
            live.next_due_at,
            Some(test_epoch() + chrono::Duration::milliseconds(2_000))
        );
        assert_eq!(gateway.calls_for("a"), 1);
        assert_eq!(shard.scheduled_len(), 1);
    }

    proptest! {
        #[test]
        fn prop_history_never_exceeds_capacity(count in 0usize..400) {
            let mut history = RecentOutcomes::default();
            for i in 0..count {
                let status = if i % 2 == 0 { MessageStatus::Success } else { MessageStatus::Failed };
                history.record(terminal(&format!("m{i}"), status, i64::try_from(i).unwrap()));
            }
            prop_assert!(history.success.len() <= HISTORY_CAPACITY);
            prop_assert!(history.failed.len() <= HISTORY_CAPACITY);
            prop_assert!(history
                .success
                .iter()
                .zip(history.success.iter().skip(1))
                .all(|(newer, older)| newer.recency() >= older.recency()));
        }
    }
}
