//! Scheduling benchmarks
//!
//! - Due index: insert and drain-all-due over a populated heap
//! - Arrival path: `new_message` with an always-accepting gateway
//! - Writer: enqueue throughput into the coalescing queue
//!
//! Run with: `cargo bench -p sms-retry-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use chrono::Duration as ChronoDuration;
use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};
use sms_retry_core::{Message, MessageId, MessageRequest, MessageState, StateUpdate};
use sms_retry_runtime::{
    CoalescingWriter, DueIndex, EngineConfig, EngineEnvironment, RetryEngine, ScheduledEntry,
    StateStore, WriterConfig,
};
use sms_retry_testing::{InMemoryObjectStore, ScriptedGateway, test_clock, test_epoch};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

fn populated_index(entries: i64) -> DueIndex {
    let index = DueIndex::new();
    for i in 0..entries {
        index.insert(ScheduledEntry::new(
            MessageId::new(format!("m{i}")),
            test_epoch() + ChronoDuration::milliseconds((i * 7919) % 16_000),
        ));
    }
    index
}

fn benchmark_due_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("due_index");

    group.bench_function("insert_into_10k", |b| {
        let index = populated_index(10_000);
        let mut i = 0_i64;
        b.iter(|| {
            i += 1;
            index.insert(black_box(ScheduledEntry::new(
                MessageId::new("bench"),
                test_epoch() + ChronoDuration::milliseconds(i % 16_000),
            )));
        });
    });

    group.throughput(Throughput::Elements(1_000));
    group.bench_function("drain_1k_of_10k", |b| {
        b.iter_batched(
            || populated_index(10_000),
            |index| {
                let due = index.drain_due(test_epoch() + ChronoDuration::milliseconds(1_600));
                black_box(due.len())
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn benchmark_arrival(c: &mut Criterion) {
    let mut group = c.benchmark_group("arrival");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");
    let _guard = runtime.enter();

    let environment = EngineEnvironment::new(
        Arc::new(ScriptedGateway::accepting()),
        Arc::new(InMemoryObjectStore::new()),
    )
    .with_clock(Arc::new(test_clock()));
    let engine = RetryEngine::new(EngineConfig::default(), environment)
        .expect("Failed to build engine");
    let counter = AtomicU64::new(0);

    group.bench_function("new_message_first_attempt_success", |b| {
        b.to_async(&runtime).iter(|| async {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            let request = MessageRequest::new("+15550100", "bench").with_id(format!("b{n}"));
            let _ = engine.new_message(black_box(request)).await;
        });
    });

    group.finish();
}

fn benchmark_writer(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_writer");
    group.throughput(Throughput::Elements(1));

    let state = MessageState::new(
        Message {
            id: MessageId::new("hot"),
            destination: "+15550100".to_string(),
            body: "bench".to_string(),
        },
        test_epoch(),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");
    let _guard = runtime.enter();

    group.bench_function("enqueue_same_message", |b| {
        let writer = CoalescingWriter::new(
            WriterConfig::default(),
            StateStore::new(Arc::new(InMemoryObjectStore::new())),
            Arc::new(test_clock()),
        );
        writer.start();
        b.iter(|| writer.enqueue(black_box(StateUpdate::pending(&state))));
    });

    group.finish();
}

criterion_group!(benches, benchmark_due_index, benchmark_arrival, benchmark_writer);
criterion_main!(benches);
