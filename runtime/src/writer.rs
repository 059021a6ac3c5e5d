//! Coalescing state writer.
//!
//! Keeps snapshot persistence off the attempt path. Updates are offered to a
//! bounded queue without waiting; a side table remembers the latest update per
//! message and how many of its queue items are still waiting, so a writer
//! iteration persists only the newest state of each message it sees and skips
//! the intermediates.
//!
//! The queue is split into one lane per worker and every message always maps
//! to the same lane, so writes for one message never race each other.
//!
//! ```text
//! enqueue ──► latest[id] = update ──► lane[hash(id) % workers].try_send
//!                                             │        queued[id] += 1
//!          worker: recv 1, drain ≤ batch_size │
//!                  queued[id] -= 1 ◄──────────┘
//!                  take latest[id], one write per id
//!                  put with retry ──► dead letter on exhaustion
//! ```

use crate::config::WriterConfig;
use crate::metrics::WriterMetrics;
use crate::persistence::{PersistenceError, StateStore};
use crate::retry::retry_with_predicate;
use crate::{DeadLetter, DeadLetterQueue};
use sms_retry_core::environment::Clock;
use sms_retry_core::{MessageId, StateUpdate};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tokio::task::JoinHandle;

const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Asynchronous, de-duplicating persistence pipeline.
///
/// Created idle: updates enqueued before [`start`](Self::start) wait in the
/// queue, which makes coalescing observable in tests.
pub struct CoalescingWriter {
    inner: Arc<WriterInner>,
    pending_receivers: Mutex<Vec<Receiver<Arc<StateUpdate>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct WriterInner {
    config: WriterConfig,
    store: StateStore,
    clock: Arc<dyn Clock>,
    lanes: RwLock<Option<Vec<Sender<Arc<StateUpdate>>>>>,
    lane_capacity: usize,
    latest: Mutex<HashMap<MessageId, PendingWrite>>,
    /// Updates accepted into a lane and not yet fully processed
    queued: AtomicUsize,
    dead_letters: DeadLetterQueue<StateUpdate>,
}

/// Side table entry; present while at least one queue item for the id waits.
#[derive(Default)]
struct PendingWrite {
    /// Newest update not yet taken by a worker
    update: Option<Arc<StateUpdate>>,
    /// Queue items for the id not yet received by a worker
    queued: usize,
}

impl CoalescingWriter {
    /// Create an idle writer.
    #[must_use]
    pub fn new(config: WriterConfig, store: StateStore, clock: Arc<dyn Clock>) -> Self {
        let lane_count = config.workers.max(1);
        let lane_capacity = config.queue_capacity.div_ceil(lane_count).max(1);

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..lane_count)
            .map(|_| mpsc::channel(lane_capacity))
            .unzip();

        let dead_letters = DeadLetterQueue::new(config.dlq_capacity);
        Self {
            inner: Arc::new(WriterInner {
                config,
                store,
                clock,
                lanes: RwLock::new(Some(senders)),
                lane_capacity,
                latest: Mutex::new(HashMap::new()),
                queued: AtomicUsize::new(0),
                dead_letters,
            }),
            pending_receivers: Mutex::new(receivers),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the writer workers. Calling it again has no effect.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let receivers: Vec<_> = lock(&self.pending_receivers).drain(..).collect();
        if receivers.is_empty() {
            return;
        }

        let mut workers = lock(&self.workers);
        for (lane, receiver) in receivers.into_iter().enumerate() {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(inner.run(lane, receiver)));
        }
        tracing::debug!(workers = workers.len(), "State writer started");
    }

    /// Offer an update without waiting.
    ///
    /// Returns `false` if the update was shed because its lane is full or the
    /// writer is closed.
    pub fn enqueue(&self, update: StateUpdate) -> bool {
        let update = Arc::new(update);
        let lanes = self
            .inner
            .lanes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let Some(lanes) = lanes.as_ref() else {
            tracing::warn!(message_id = %update.message_id(), "State writer closed, dropping update");
            WriterMetrics::record_dropped();
            return false;
        };
        let lane = &lanes[update.message_id().bucket(lanes.len())];
        let id = update.message_id().clone();

        // Held across try_send so a worker cannot receive the item before it is counted
        let mut latest = self.inner.latest();
        let slot = latest.entry(id.clone()).or_default();
        slot.update = Some(Arc::clone(&update));

        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        match lane.try_send(update) {
            Ok(()) => {
                slot.queued += 1;
                WriterMetrics::record_enqueued();
                true
            },
            Err(TrySendError::Full(update) | TrySendError::Closed(update)) => {
                self.inner.queued.fetch_sub(1, Ordering::SeqCst);
                // A queued item for the same id writes this update in its place
                if slot.queued == 0 {
                    latest.remove(&id);
                }
                drop(latest);
                tracing::warn!(
                    message_id = %update.message_id(),
                    kind = update.kind.as_str(),
                    "State writer queue full, dropping update"
                );
                WriterMetrics::record_dropped();
                false
            },
        }
    }

    /// Updates accepted but not yet processed.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Total queue capacity across lanes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lane_capacity * self.inner.config.workers.max(1)
    }

    /// Updates whose persistence failed after retries, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter<StateUpdate>> {
        self.inner.dead_letters.snapshot()
    }

    /// The dead letter queue, for health reporting.
    #[must_use]
    pub fn dead_letter_queue(&self) -> &DeadLetterQueue<StateUpdate> {
        &self.inner.dead_letters
    }

    /// Re-enqueue every dead letter that has not been superseded.
    ///
    /// A dead letter is superseded when a newer update for the same message
    /// is waiting in the side table; that newer update will be written instead.
    /// Returns the number of updates re-enqueued.
    pub fn replay_dead_letters(&self) -> usize {
        let letters = self.inner.dead_letters.drain();
        let mut replayed = 0;

        for letter in letters {
            if self.inner.has_newer(letter.payload.message_id()) {
                tracing::debug!(message_id = %letter.payload.message_id(), "Dead letter superseded");
                continue;
            }
            if self.enqueue(letter.payload) {
                replayed += 1;
            }
        }

        tracing::info!(replayed, "Replayed dead letters");
        replayed
    }

    /// Wait until every accepted update has been processed.
    ///
    /// # Errors
    ///
    /// Returns the backlog still outstanding when `timeout` expires.
    pub async fn flush(&self, timeout: Duration) -> Result<(), usize> {
        let start = Instant::now();
        loop {
            let backlog = self.backlog();
            if backlog == 0 {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(backlog);
            }
            tokio::time::sleep(FLUSH_POLL_INTERVAL).await;
        }
    }

    /// Stop accepting updates, drain the lanes and stop the workers.
    ///
    /// # Errors
    ///
    /// Returns the backlog still outstanding when `timeout` expires; the
    /// workers keep draining in the background in that case.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), usize> {
        // Dropping the senders lets each worker exit once its lane is empty
        self.inner
            .lanes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        let joined = tokio::time::timeout(timeout, futures::future::join_all(workers)).await;
        match joined {
            Ok(_) => {
                tracing::info!("State writer stopped");
                Ok(())
            },
            Err(_) => Err(self.backlog()),
        }
    }
}

impl WriterInner {
    fn latest(&self) -> MutexGuard<'_, HashMap<MessageId, PendingWrite>> {
        lock(&self.latest)
    }

    /// Whether an update for `id` is waiting to be written.
    fn has_newer(&self, id: &MessageId) -> bool {
        self.latest()
            .get(id)
            .is_some_and(|slot| slot.update.is_some())
    }

    async fn run(self: Arc<Self>, lane: usize, mut receiver: Receiver<Arc<StateUpdate>>) {
        while let Some(first) = receiver.recv().await {
            let mut batch = vec![first];
            while batch.len() <= self.config.batch_size {
                match receiver.try_recv() {
                    Ok(update) => batch.push(update),
                    Err(_) => break,
                }
            }

            let received = batch.len();
            self.write_batch(batch).await;
            self.queued.fetch_sub(received, Ordering::SeqCst);
        }
        tracing::debug!(lane, "State writer worker exiting");
    }

    async fn write_batch(&self, batch: Vec<Arc<StateUpdate>>) {
        let received = batch.len();
        let writes = self.claim(&batch);

        WriterMetrics::record_coalesced(received - writes.len());
        WriterMetrics::record_batch(writes.len());

        for update in writes {
            self.persist(update).await;
        }
    }

    /// Count the batch out of the side table and take the newest update of
    /// each id in it.
    fn claim(&self, batch: &[Arc<StateUpdate>]) -> Vec<Arc<StateUpdate>> {
        let mut latest = self.latest();
        let mut seen = HashSet::with_capacity(batch.len());
        let mut writes = Vec::with_capacity(batch.len());

        for item in batch {
            let id = item.message_id();
            let Some(slot) = latest.get_mut(id) else {
                continue;
            };
            slot.queued = slot.queued.saturating_sub(1);
            if seen.insert(id.clone()) {
                writes.extend(slot.update.take());
            }
            if slot.queued == 0 {
                latest.remove(id);
            }
        }
        writes
    }

    async fn persist(&self, update: Arc<StateUpdate>) {
        let started = Instant::now();
        let (store, clock) = (&self.store, &self.clock);
        let snapshot: &StateUpdate = &update;

        let result = retry_with_predicate(
            &self.config.retry_policy,
            || async move {
                let result = store.write(snapshot, clock.now()).await;
                if result.is_err() {
                    WriterMetrics::record_write_error();
                }
                result
            },
            PersistenceError::is_transient,
        )
        .await;

        match result {
            Ok(()) => WriterMetrics::record_write(started.elapsed()),
            Err(err) => self.dead_letter(update, &err),
        }
    }

    fn dead_letter(&self, update: Arc<StateUpdate>, err: &PersistenceError) {
        if self.has_newer(update.message_id()) {
            tracing::warn!(
                message_id = %update.message_id(),
                error = %err,
                "State write failed, newer update pending"
            );
            return;
        }

        tracing::error!(
            message_id = %update.message_id(),
            kind = update.kind.as_str(),
            error = %err,
            "State write failed after retries, moving to dead letter queue"
        );
        WriterMetrics::record_dead_letter();
        let update = Arc::unwrap_or_clone(update);
        self.dead_letters.push(
            update,
            err.to_string(),
            self.config.retry_policy.max_retries,
            self.clock.now(),
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl std::fmt::Debug for CoalescingWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingWriter")
            .field("backlog", &self.backlog())
            .field("capacity", &self.capacity())
            .field("dead_letters", &self.inner.dead_letters.len())
            .finish_non_exhaustive()
    }
}
