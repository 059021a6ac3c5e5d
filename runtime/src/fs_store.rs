//! [`ObjectStore`] backed by a local directory.
//!
//! Each key maps to one file under the root, with `/` separating
//! directories. Writes go to a hidden temporary file in the target directory
//! and are renamed into place, so readers never see a partial object.
//! Hidden entries (names starting with `.`) are never listed, and keys may not
//! contain such segments.

use sms_retry_core::object_store::{ListPage, ObjectStore, ObjectStoreError, StoreFuture};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FileSystemObjectStore {
    root: PathBuf,
    page_size: usize,
}

impl FileSystemObjectStore {
    /// Keys returned per listing page unless overridden.
    pub const DEFAULT_PAGE_SIZE: usize = 1000;

    /// Store objects under `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }

    /// Limit listing pages to `page_size` keys (at least 1).
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        if key.is_empty() {
            return Err(ObjectStoreError::InvalidKey("empty key".to_string()));
        }
        self.dir_for(key)
            .map_err(|_| ObjectStoreError::InvalidKey(key.to_string()))
    }

    fn dir_for(&self, relative: &str) -> Result<PathBuf, ObjectStoreError> {
        let mut path = self.root.clone();
        if relative.is_empty() {
            return Ok(path);
        }
        for segment in relative.split('/') {
            if segment.is_empty() || segment.starts_with('.') || segment.contains('\\') {
                return Err(ObjectStoreError::InvalidKey(relative.to_string()));
            }
            path.push(segment);
        }
        Ok(path)
    }

    async fn write_atomic(&self, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key)?;
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        };

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(key, &e))?;

        let temp = parent.join(format!(
            ".{}.{:016x}.tmp",
            name.to_string_lossy(),
            rand::random::<u64>()
        ));

        let written = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp, &path).await
        }
        .await;

        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error(key, &err));
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            },
            Err(err) => Err(io_error(key, &err)),
        }
    }

    /// One page of keys under `prefix`, in ascending order.
    ///
    /// Walks the tree depth first with siblings sorted as their keys sort, so
    /// keys come out in order. Subtrees that sort entirely at or before the
    /// continuation are skipped without being read, and the walk stops once
    /// the page is full.
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage, ObjectStoreError> {
        let after = continuation.as_deref();
        let start = prefix.rsplit_once('/').map_or("", |(dir, _)| dir);
        let mut stack = vec![Node::Dir(self.dir_for(start)?, start.to_string())];
        let mut keys = Vec::new();

        while let Some(node) = stack.pop() {
            let (dir, dir_key) = match node {
                Node::File(key) => {
                    keys.push(key);
                    if keys.len() > self.page_size {
                        break;
                    }
                    continue;
                },
                Node::Dir(dir, dir_key) => (dir, dir_key),
            };

            let mut children = Vec::new();
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_error(&dir_key, &err)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(&dir_key, &e))?
            {
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }

                let key = if dir_key.is_empty() {
                    name.to_string()
                } else {
                    format!("{dir_key}/{name}")
                };
                let file_type = entry.file_type().await.map_err(|e| io_error(&key, &e))?;

                if file_type.is_dir() {
                    let subtree = format!("{key}/");
                    let wanted = subtree.starts_with(prefix) || prefix.starts_with(&subtree);
                    if wanted && !sorts_before(&subtree, after) {
                        children.push((subtree, Node::Dir(entry.path(), key)));
                    }
                } else if file_type.is_file()
                    && key.starts_with(prefix)
                    && after.is_none_or(|after| key.as_str() > after)
                {
                    children.push((key.clone(), Node::File(key)));
                }
            }

            // Directories sort by their `name/` form so the walk follows key order
            children.sort_unstable_by(|a, b| a.0.cmp(&b.0));
            stack.extend(children.into_iter().rev().map(|(_, node)| node));
        }

        let more = keys.len() > self.page_size;
        keys.truncate(self.page_size);
        Ok(ListPage {
            continuation: if more { keys.last().cloned() } else { None },
            keys,
        })
    }
}

enum Node {
    Dir(PathBuf, String),
    File(String),
}

/// Whether every key under `subtree` sorts at or before `after`.
fn sorts_before(subtree: &str, after: Option<&str>) -> bool {
    after.is_some_and(|after| after > subtree && !after.starts_with(subtree))
}

fn io_error(key: &str, err: &std::io::Error) -> ObjectStoreError {
    ObjectStoreError::Io(format!("{key}: {err}"))
}

impl ObjectStore for FileSystemObjectStore {
    fn put<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> StoreFuture<'a, ()> {
        Box::pin(self.write_atomic(key, bytes))
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(self.read(key))
    }

    fn list<'a>(&'a self, prefix: &'a str, continuation: Option<String>) -> StoreFuture<'a, ListPage> {
        Box::pin(self.list_page(prefix, continuation))
    }
}
