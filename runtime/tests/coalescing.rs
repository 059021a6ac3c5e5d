//! Integration tests for the coalescing state writer.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::fast_writer;
use proptest::prelude::*;
use sms_retry_core::{Message, MessageId, MessageState, StateUpdate};
use sms_retry_runtime::persistence::PENDING_PREFIX;
use sms_retry_runtime::{CoalescingWriter, StateStore};
use sms_retry_testing::{InMemoryObjectStore, test_clock, test_epoch};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const FLUSH: Duration = Duration::from_secs(5);

fn state(id: &str, attempt_count: u32) -> MessageState {
    let mut state = MessageState::new(
        Message {
            id: MessageId::new(id),
            destination: "+15550100".to_string(),
            body: "hello".to_string(),
        },
        test_epoch(),
    );
    state.attempt_count = attempt_count;
    state
}

fn idle_writer(objects: &Arc<InMemoryObjectStore>) -> CoalescingWriter {
    CoalescingWriter::new(
        fast_writer(),
        StateStore::new(objects.clone()),
        Arc::new(test_clock()),
    )
}

fn stored(objects: &InMemoryObjectStore, id: &str) -> MessageState {
    let key = StateStore::pending_key(&MessageId::new(id));
    StateStore::decode(&key, &objects.object(&key).unwrap()).unwrap()
}

#[tokio::test]
async fn test_burst_for_one_message_is_written_once() {
    let objects = Arc::new(InMemoryObjectStore::new());
    let writer = idle_writer(&objects);

    for attempt in 1..=5 {
        assert!(writer.enqueue(StateUpdate::pending(&state("burst", attempt))));
    }
    writer.start();
    writer.flush(FLUSH).await.unwrap();

    let key = StateStore::pending_key(&MessageId::new("burst"));
    assert_eq!(objects.puts_for(&key), 1);
    assert_eq!(stored(&objects, "burst").attempt_count, 5);
}

#[tokio::test]
async fn test_terminal_update_supersedes_queued_pending_ones() {
    let objects = Arc::new(InMemoryObjectStore::new());
    let writer = idle_writer(&objects);

    writer.enqueue(StateUpdate::pending(&state("t", 1)));
    writer.enqueue(StateUpdate::pending(&state("t", 2)));
    let mut done = state("t", 2);
    done.apply_attempt(3, Ok(true), test_epoch()).unwrap();
    writer.enqueue(StateUpdate::of(&done));

    writer.start();
    writer.flush(FLUSH).await.unwrap();

    assert_eq!(
        objects.put_log(),
        vec![
            StateStore::pending_key(&MessageId::new("t")),
            "state/success/2025/01/01/00/t.json".to_string(),
        ]
    );
    assert!(!stored(&objects, "t").is_pending());
}

#[tokio::test]
async fn test_small_batches_still_write_every_message() {
    let objects = Arc::new(InMemoryObjectStore::new());
    let writer = CoalescingWriter::new(
        fast_writer().with_batch_size(2).with_workers(1),
        StateStore::new(objects.clone()),
        Arc::new(test_clock()),
    );

    for i in 0..9 {
        writer.enqueue(StateUpdate::pending(&state(&format!("m{i}"), 1)));
    }
    writer.start();
    writer.flush(FLUSH).await.unwrap();

    assert_eq!(objects.keys_with_prefix(PENDING_PREFIX).len(), 9);
    assert_eq!(objects.put_log().len(), 9);
}

#[tokio::test]
async fn test_update_after_write_is_written_again() {
    let objects = Arc::new(InMemoryObjectStore::new());
    let writer = idle_writer(&objects);
    writer.start();

    writer.enqueue(StateUpdate::pending(&state("again", 1)));
    writer.flush(FLUSH).await.unwrap();
    writer.enqueue(StateUpdate::pending(&state("again", 2)));
    writer.flush(FLUSH).await.unwrap();

    let key = StateStore::pending_key(&MessageId::new("again"));
    assert_eq!(objects.puts_for(&key), 2);
    assert_eq!(stored(&objects, "again").attempt_count, 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_last_update_per_message_wins(
        updates in prop::collection::vec((0usize..5, 1u32..=6), 1..60)
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let objects = Arc::new(InMemoryObjectStore::new());
            let writer = idle_writer(&objects);

            let mut last = HashMap::new();
            for (message, attempt) in &updates {
                let id = format!("m{message}");
                writer.enqueue(StateUpdate::pending(&state(&id, *attempt)));
                last.insert(id, *attempt);
            }
            writer.start();
            writer.flush(FLUSH).await.unwrap();

            prop_assert_eq!(objects.put_log().len(), last.len());
            for (id, attempt) in &last {
                prop_assert_eq!(stored(&objects, id).attempt_count, *attempt);
            }
            Ok(())
        })?;
    }
}
