//! Durable key-addressed blob storage.
//!
//! The retry engine persists message snapshots through this narrow interface.
//! It is modeled on cloud object storage: unconditional overwrite, prefix
//! listing with continuation tokens, and whole-object reads.
//!
//! # Implementations
//!
//! - `FileSystemObjectStore` (in `sms-retry-runtime`): one file per key under a root directory
//! - `InMemoryObjectStore` (in `sms-retry-testing`): fast, deterministic testing

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by [`ObjectStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ObjectStoreError>> + Send + 'a>>;

/// Errors from object store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    /// No object exists under the key.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The key cannot be represented by this backend.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Backend or transport failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Keys in this page, in ascending order.
    pub keys: Vec<String>,

    /// Token to pass to the next `list` call, `None` on the last page.
    pub continuation: Option<String>,
}

/// Key-addressed object storage.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the coalescing writer calls `put`
/// from several worker tasks at once.
pub trait ObjectStore: Send + Sync {
    /// Create or overwrite the object under `key`.
    fn put<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> StoreFuture<'a, ()>;

    /// Read the whole object under `key`.
    ///
    /// Returns [`ObjectStoreError::NotFound`] if it does not exist.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>>;

    /// List keys starting with `prefix`, one page at a time.
    ///
    /// Pass `None` for the first page and the returned `continuation` for
    /// subsequent pages.
    fn list<'a>(&'a self, prefix: &'a str, continuation: Option<String>) -> StoreFuture<'a, ListPage>;
}
