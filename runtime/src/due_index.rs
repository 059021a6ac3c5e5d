//! Due-time index: a min-heap of scheduled attempts.
//!
//! Entries are never updated in place. A reschedule pushes a new entry and
//! the old one stays in the heap until drained; the retry task recognizes it
//! as stale by comparing against the live state.

use chrono::{DateTime, Utc};
use sms_retry_core::MessageId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};

/// A message due for its next attempt at `due_at`.
///
/// Ordered by due time first, so the heap pops the earliest entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScheduledEntry {
    /// Absolute due time.
    pub due_at: DateTime<Utc>,
    /// Message to attempt.
    pub message_id: MessageId,
}

impl ScheduledEntry {
    /// Create an entry.
    #[must_use]
    pub const fn new(message_id: MessageId, due_at: DateTime<Utc>) -> Self {
        Self { due_at, message_id }
    }
}

/// Thread-safe min-heap of [`ScheduledEntry`] values.
#[derive(Debug, Default)]
pub struct DueIndex {
    heap: Mutex<BinaryHeap<Reverse<ScheduledEntry>>>,
}

impl DueIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry.
    pub fn insert(&self, entry: ScheduledEntry) {
        self.lock().push(Reverse(entry));
    }

    /// Remove and return every entry with `due_at <= now`, earliest first.
    ///
    /// Holds the lock only while popping; never waits on anything else.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<ScheduledEntry> {
        let mut heap = self.lock();
        let mut due = Vec::new();
        while heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.due_at <= now)
        {
            if let Some(Reverse(entry)) = heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    /// Earliest registered due time, stale entries included.
    #[must_use]
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock().peek().map(|Reverse(entry)| entry.due_at)
    }

    /// Number of registered entries, stale entries included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no entry is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Reverse<ScheduledEntry>>> {
        self.heap
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn entry(id: &str, offset_ms: i64) -> ScheduledEntry {
        ScheduledEntry::new(MessageId::new(id), base() + Duration::milliseconds(offset_ms))
    }

    #[test]
    fn test_drain_due_returns_only_due_entries() {
        let index = DueIndex::new();
        index.insert(entry("late", 2_000));
        index.insert(entry("early", 500));
        index.insert(entry("exact", 1_000));

        let due = index.drain_due(base() + Duration::milliseconds(1_000));

        let ids: Vec<_> = due.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "exact"]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.next_due(), Some(base() + Duration::milliseconds(2_000)));
    }

    #[test]
    fn test_duplicate_entries_coexist() {
        let index = DueIndex::new();
        index.insert(entry("a", 500));
        index.insert(entry("a", 2_000));

        assert_eq!(index.len(), 2);
        assert_eq!(index.drain_due(base() + Duration::seconds(5)).len(), 2);
        assert!(index.is_empty());
    }

    #[test]
    fn test_drain_on_empty_index() {
        let index = DueIndex::new();
        assert!(index.drain_due(base()).is_empty());
        assert_eq!(index.next_due(), None);
    }

    proptest! {
        #[test]
        fn prop_drain_is_sorted_and_complete(
            offsets in prop::collection::vec(0i64..20_000, 0..64),
            cutoff in 0i64..20_000,
        ) {
            let index = DueIndex::new();
            for (i, offset) in offsets.iter().enumerate() {
                index.insert(entry(&format!("m{i}"), *offset));
            }

            let now = base() + Duration::milliseconds(cutoff);
            let due = index.drain_due(now);

            prop_assert!(due.windows(2).all(|pair| pair[0].due_at <= pair[1].due_at));
            prop_assert!(due.iter().all(|e| e.due_at <= now));
            let expected = offsets.iter().filter(|offset| **offset <= cutoff).count();
            prop_assert_eq!(due.len(), expected);
            prop_assert_eq!(index.len(), offsets.len() - expected);
        }
    }
}
