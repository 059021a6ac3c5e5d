//! In-memory object store for fast, deterministic testing.
//!
//! Keys are kept in a `BTreeMap`, so listings come back sorted and pagination
//! is stable. Every successful `put` is appended to a log, which lets tests
//! count writes per key. Failures can be injected for the next N puts or for
//! every put under a key prefix.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks in tests

use sms_retry_core::object_store::{ListPage, ObjectStore, ObjectStoreError, StoreFuture};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug)]
struct Objects {
    data: BTreeMap<String, Vec<u8>>,
    put_log: Vec<String>,
    fail_next_puts: usize,
    fail_prefix: Option<String>,
    page_size: usize,
}

/// In-memory object store.
///
/// # Example
///
/// ```
/// use sms_retry_testing::InMemoryObjectStore;
/// use sms_retry_core::ObjectStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryObjectStore::new();
/// store.put("state/pending/7/msg-1.json", b"{}".to_vec()).await?;
///
/// assert_eq!(store.get("state/pending/7/msg-1.json").await?, b"{}".to_vec());
/// assert_eq!(store.puts_for("state/pending/7/msg-1.json"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryObjectStore {
    objects: Arc<RwLock<Objects>>,
}

impl InMemoryObjectStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(Objects {
                data: BTreeMap::new(),
                put_log: Vec::new(),
                fail_next_puts: 0,
                fail_prefix: None,
                page_size: DEFAULT_PAGE_SIZE,
            })),
        }
    }

    /// Create a store whose listings return at most `page_size` keys per page
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        let store = Self::new();
        store.objects.write().unwrap().page_size = page_size.max(1);
        store
    }

    /// Seed an object without recording it in the put log
    pub fn insert(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .unwrap()
            .data
            .insert(key.into(), bytes.into());
    }

    /// Current contents of `key`
    #[must_use]
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().unwrap().data.get(key).cloned()
    }

    /// All keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().unwrap().data.keys().cloned().collect()
    }

    /// Keys starting with `prefix`, sorted
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.objects
            .read()
            .unwrap()
            .data
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of stored objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().unwrap().data.len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().unwrap().data.is_empty()
    }

    /// Keys of every successful put, in order
    #[must_use]
    pub fn put_log(&self) -> Vec<String> {
        self.objects.read().unwrap().put_log.clone()
    }

    /// Number of successful puts to `key`
    #[must_use]
    pub fn puts_for(&self, key: &str) -> usize {
        self.objects
            .read()
            .unwrap()
            .put_log
            .iter()
            .filter(|logged| logged.as_str() == key)
            .count()
    }

    /// Make the next `count` puts fail with a backend error
    pub fn fail_next_puts(&self, count: usize) {
        self.objects.write().unwrap().fail_next_puts = count;
    }

    /// Make every put under `prefix` fail until [`clear_failures`](Self::clear_failures)
    pub fn fail_puts_with_prefix(&self, prefix: impl Into<String>) {
        self.objects.write().unwrap().fail_prefix = Some(prefix.into());
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        let mut objects = self.objects.write().unwrap();
        objects.fail_next_puts = 0;
        objects.fail_prefix = None;
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut objects = self.objects.write().unwrap();

            if objects.fail_next_puts > 0 {
                objects.fail_next_puts -= 1;
                return Err(ObjectStoreError::Backend(format!(
                    "injected put failure: {key}"
                )));
            }
            if objects
                .fail_prefix
                .as_deref()
                .is_some_and(|prefix| key.starts_with(prefix))
            {
                return Err(ObjectStoreError::Backend(format!(
                    "injected prefix failure: {key}"
                )));
            }

            objects.data.insert(key.to_string(), bytes);
            objects.put_log.push(key.to_string());
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.objects
                .read()
                .unwrap()
                .data
                .get(key)
                .cloned()
                .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
        })
    }

    fn list<'a>(&'a self, prefix: &'a str, continuation: Option<String>) -> StoreFuture<'a, ListPage> {
        Box::pin(async move {
            let objects = self.objects.read().unwrap();
            let mut matching = objects
                .data
                .keys()
                .filter(|key| key.starts_with(prefix))
                .filter(|key| continuation.as_ref().is_none_or(|after| *key > after));

            let keys: Vec<String> = matching.by_ref().take(objects.page_size).cloned().collect();
            let more = matching.next().is_some();

            Ok(ListPage {
                continuation: if more { keys.last().cloned() } else { None },
                keys,
            })
        })
    }
}
