//! Integration tests for crash recovery from persisted pending snapshots.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::{Harness, WAIT, fast_writer, offset, request};
use sms_retry_core::{Message, MessageId, MessageState, MessageStatus};
use sms_retry_runtime::{
    EngineConfig, EngineEnvironment, FileSystemObjectStore, RecoveryReport, RetryEngine,
    StateStore,
};
use sms_retry_testing::{InMemoryObjectStore, ManualClock, ScriptedGateway};
use std::path::Path;
use std::sync::Arc;

fn pending(id: &str, attempt_count: u32, due_ms: Option<i64>) -> MessageState {
    let mut state = MessageState::new(
        Message {
            id: MessageId::new(id),
            destination: "+15550100".to_string(),
            body: "hello".to_string(),
        },
        offset(0),
    );
    state.attempt_count = attempt_count;
    state.next_due_at = due_ms.map(offset);
    state
}

fn seed(objects: &InMemoryObjectStore, state: &MessageState) {
    objects.insert(
        StateStore::pending_key(&state.message_id),
        StateStore::encode(state).unwrap(),
    );
}

#[tokio::test]
async fn test_overdue_snapshots_are_attempted_on_first_tick() {
    let objects = Arc::new(InMemoryObjectStore::new());
    let ids: Vec<String> = (0..20).map(|i| format!("p{i}")).collect();
    for id in &ids {
        seed(&objects, &pending(id, 1, Some(500)));
    }

    let h = Harness::with_objects(ScriptedGateway::rejecting(), objects);
    h.at(10_000);

    let report = h.engine.recover().await.unwrap();
    assert_eq!(report, RecoveryReport { recovered: 20, skipped_terminal: 0, malformed: 0 });

    assert_eq!(h.tick().await, 20);
    for id in &ids {
        assert_eq!(h.gateway.calls_for(id.as_str()), 1);
        let state = h.state(id).await;
        assert_eq!(state.attempt_count, 2);
        assert_eq!(state.next_due_at, Some(offset(2_000)));
    }
}

#[tokio::test]
async fn test_future_snapshot_waits_for_its_due_time() {
    let objects = Arc::new(InMemoryObjectStore::new());
    seed(&objects, &pending("later", 2, Some(2_000)));

    let h = Harness::with_objects(ScriptedGateway::rejecting(), objects);
    h.at(1_000);
    h.engine.recover().await.unwrap();

    assert_eq!(h.tick().await, 0);
    h.at(2_000);
    assert_eq!(h.tick().await, 1);
    assert_eq!(h.state("later").await.attempt_count, 3);
}

#[tokio::test]
async fn test_snapshot_without_due_time_is_due_immediately() {
    let objects = Arc::new(InMemoryObjectStore::new());
    seed(&objects, &pending("undated", 1, None));

    let h = Harness::with_objects(ScriptedGateway::accepting(), objects);
    h.at(700);
    h.engine.recover().await.unwrap();

    assert_eq!(h.state("undated").await.next_due_at, Some(offset(700)));
    assert_eq!(h.tick().await, 1);
    assert_eq!(h.state("undated").await.status, MessageStatus::Success);
}

#[tokio::test]
async fn test_terminal_and_malformed_snapshots_are_skipped() {
    let objects = Arc::new(InMemoryObjectStore::new());

    let mut done = pending("done", 1, None);
    done.apply_attempt(2, Ok(true), offset(500)).unwrap();
    seed(&objects, &done);
    seed(&objects, &pending("exhausted", 6, Some(16_000)));
    objects.insert("state/pending/1/garbage.json", b"{not json".to_vec());
    seed(&objects, &pending("live", 1, Some(500)));

    let h = Harness::with_objects(ScriptedGateway::rejecting(), objects);
    h.at(20_000);
    let report = h.engine.recover().await.unwrap();

    assert_eq!(report.recovered, 1);
    assert_eq!(report.skipped_terminal, 1);
    assert_eq!(report.malformed, 2);

    h.tick().await;
    assert_eq!(h.gateway.total_calls(), 1);
    assert_eq!(h.gateway.calls_for("live"), 1);
    assert!(h.engine.message_state(&"done".into()).await.is_none());
}

#[tokio::test]
async fn test_restart_resumes_where_previous_engine_stopped() {
    let objects = Arc::new(InMemoryObjectStore::new());

    let first = Harness::with_objects(ScriptedGateway::rejecting(), objects.clone());
    for id in ["r1", "r2", "r3"] {
        first.send(id).await;
    }
    first.at(500);
    first.tick().await;
    first.engine.shutdown(WAIT).await.unwrap();

    let second = Harness::with_objects(ScriptedGateway::accepting(), objects);
    second.at(2_500);
    let report = second.engine.recover().await.unwrap();
    assert_eq!(report.recovered, 3);

    assert_eq!(second.tick().await, 3);
    for id in ["r1", "r2", "r3"] {
        let state = second.state(id).await;
        assert_eq!(state.status, MessageStatus::Success);
        assert_eq!(state.attempt_count, 3);
    }

    // The retried successes overwrite their pending snapshots
    second.settle().await;
    let third = Harness::with_objects(ScriptedGateway::accepting(), second.objects.clone());
    let report = third.engine.recover().await.unwrap();
    assert_eq!(report.recovered, 0);
    assert_eq!(report.skipped_terminal, 3);
}

fn engine_on_disk(root: &Path, gateway: &ScriptedGateway) -> RetryEngine {
    let environment = EngineEnvironment::new(
        Arc::new(gateway.clone()),
        Arc::new(FileSystemObjectStore::new(root).with_page_size(2)),
    )
    .with_clock(Arc::new(ManualClock::at_test_epoch()));
    let config = EngineConfig::default().with_shards(4).with_writer(fast_writer());
    RetryEngine::new(config, environment).unwrap()
}

#[tokio::test]
async fn test_path_like_ids_survive_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let ids = [".alert", "a//b", "..", "x\\y", "../../etc/passwd", "plain"];

    let first = engine_on_disk(dir.path(), &ScriptedGateway::rejecting());
    for id in ids {
        first.new_message(request(id)).await.unwrap();
    }
    first.shutdown(WAIT).await.unwrap();
    assert!(first.dead_letters().is_empty());

    let gateway = ScriptedGateway::accepting();
    let second = engine_on_disk(dir.path(), &gateway);
    let report = second.recover().await.unwrap();
    assert_eq!(report, RecoveryReport { recovered: ids.len(), skipped_terminal: 0, malformed: 0 });

    for id in ids {
        let state = second.message_state(&id.into()).await.unwrap();
        assert_eq!(state.attempt_count, 1);
        assert_eq!(state.destination, "+15550100");
    }
    assert!(!dir.path().join("etc").exists());
}
