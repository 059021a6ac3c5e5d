//! Shared harness for engine integration tests.

#![allow(dead_code)] // Not every test file uses every helper

use sms_retry_core::{MessageRequest, MessageState};
use sms_retry_runtime::{EngineConfig, EngineEnvironment, RetryEngine, RetryPolicy, WriterConfig};
use sms_retry_testing::{InMemoryObjectStore, ManualClock, ScriptedGateway, test_epoch};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub engine: RetryEngine,
    pub gateway: ScriptedGateway,
    pub objects: Arc<InMemoryObjectStore>,
    pub clock: ManualClock,
}

pub fn fast_writer() -> WriterConfig {
    WriterConfig::default().with_retry_policy(
        RetryPolicy::builder()
            .max_retries(1)
            .initial_delay(Duration::from_millis(1))
            .build(),
    )
}

impl Harness {
    pub fn new(gateway: ScriptedGateway) -> Self {
        Self::with_objects(gateway, Arc::new(InMemoryObjectStore::new()))
    }

    pub fn with_objects(gateway: ScriptedGateway, objects: Arc<InMemoryObjectStore>) -> Self {
        let config = EngineConfig::default()
            .with_shards(4)
            .with_workers_per_shard(2)
            .with_writer(fast_writer());
        Self::with_config(config, gateway, objects)
    }

    pub fn with_config(
        config: EngineConfig,
        gateway: ScriptedGateway,
        objects: Arc<InMemoryObjectStore>,
    ) -> Self {
        let clock = ManualClock::at_test_epoch();
        let environment = EngineEnvironment::new(Arc::new(gateway.clone()), objects.clone())
            .with_clock(Arc::new(clock.clone()));
        let engine = RetryEngine::new(config, environment).unwrap();

        Self {
            engine,
            gateway,
            objects,
            clock,
        }
    }

    /// Move the clock to `offset_ms` after the test epoch.
    pub fn at(&self, offset_ms: i64) {
        self.clock
            .set(test_epoch() + chrono::Duration::milliseconds(offset_ms));
    }

    /// One scheduler tick, waiting for the dispatched attempts to finish.
    pub async fn tick(&self) -> usize {
        let dispatched = self.engine.wakeup();
        self.engine.wait_idle(WAIT).await.unwrap();
        dispatched
    }

    pub async fn settle(&self) {
        self.engine.wait_idle(WAIT).await.unwrap();
        self.engine.flush(WAIT).await.unwrap();
    }

    pub async fn send(&self, id: &str) {
        self.engine.new_message(request(id)).await.unwrap();
    }

    pub async fn state(&self, id: &str) -> MessageState {
        self.engine.message_state(&id.into()).await.unwrap()
    }
}

pub fn request(id: &str) -> MessageRequest {
    MessageRequest::new("+15550100", format!("body of {id}")).with_id(id)
}

pub fn offset(ms: i64) -> chrono::DateTime<chrono::Utc> {
    test_epoch() + chrono::Duration::milliseconds(ms)
}
