//! Snapshot persistence on top of an [`ObjectStore`].
//!
//! # Key layout
//!
//! ```text
//! state/pending/<stable-hash % 256>/<id>.json          live retry state, scanned by recovery
//! state/success/<yyyy>/<MM>/<dd>/<HH>/<id>.json        audit history (UTC hour of the write)
//! state/failed/<yyyy>/<MM>/<dd>/<HH>/<id>.json
//! ```
//!
//! `<id>` is the percent-encoded identifier, with `.` encoded as well, so any
//! identifier becomes a single, non-hidden path segment.
//!
//! A terminal snapshot of a message that was retried also overwrites the
//! pending key, so recovery finds a terminal record there and skips it.

use chrono::{DateTime, Utc};
use sms_retry_core::object_store::{ObjectStore, ObjectStoreError};
use sms_retry_core::{MessageId, MessageState, StateUpdate, UpdateKind};
use std::sync::Arc;
use thiserror::Error;

/// Prefix scanned by recovery.
pub const PENDING_PREFIX: &str = "state/pending/";

/// Number of partitions under [`PENDING_PREFIX`].
pub const PENDING_PARTITIONS: usize = 256;

/// Errors from snapshot persistence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// The object store failed.
    #[error("Object store error: {0}")]
    Store(#[from] ObjectStoreError),

    /// A state could not be encoded.
    #[error("Failed to encode state for {message_id}: {reason}")]
    Encode {
        /// Message whose state failed to encode
        message_id: MessageId,
        /// Encoder error
        reason: String,
    },

    /// A stored object is not a valid snapshot.
    #[error("Malformed snapshot at {key}: {reason}")]
    Decode {
        /// Object key
        key: String,
        /// Decoder error
        reason: String,
    },
}

impl PersistenceError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(ObjectStoreError::Backend(_) | ObjectStoreError::Io(_))
        )
    }
}

/// Result of scanning the pending partition.
#[derive(Debug, Default)]
pub struct PendingScan {
    /// Decoded snapshots, in key order.
    pub states: Vec<MessageState>,
    /// Objects that could not be read or decoded.
    pub malformed: usize,
}

/// Reads and writes message snapshots.
#[derive(Clone)]
pub struct StateStore {
    objects: Arc<dyn ObjectStore>,
}

impl StateStore {
    /// Wrap an object store.
    #[must_use]
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    /// Key of the pending snapshot for `id`.
    #[must_use]
    pub fn pending_key(id: &MessageId) -> String {
        format!(
            "{PENDING_PREFIX}{}/{}.json",
            id.bucket(PENDING_PARTITIONS),
            key_segment(id)
        )
    }

    /// Key of a terminal snapshot written at `written_at`.
    #[must_use]
    pub fn terminal_key(kind: UpdateKind, id: &MessageId, written_at: DateTime<Utc>) -> String {
        format!(
            "state/{}/{}/{}.json",
            kind.as_str(),
            written_at.format("%Y/%m/%d/%H"),
            key_segment(id)
        )
    }

    /// Key `update` is stored under when written at `written_at`.
    #[must_use]
    pub fn key_for(update: &StateUpdate, written_at: DateTime<Utc>) -> String {
        match update.kind {
            UpdateKind::Pending => Self::pending_key(update.message_id()),
            kind => Self::terminal_key(kind, update.message_id(), written_at),
        }
    }

    /// JSON form of a state.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Encode`] if serialization fails.
    pub fn encode(state: &MessageState) -> Result<Vec<u8>, PersistenceError> {
        serde_json::to_vec(state).map_err(|err| PersistenceError::Encode {
            message_id: state.message_id.clone(),
            reason: err.to_string(),
        })
    }

    /// Parse a stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Decode`] if `bytes` is not a valid snapshot.
    pub fn decode(key: &str, bytes: &[u8]) -> Result<MessageState, PersistenceError> {
        serde_json::from_slice(bytes).map_err(|err| PersistenceError::Decode {
            key: key.to_string(),
            reason: err.to_string(),
        })
    }

    /// Persist one update.
    ///
    /// Terminal updates of retried messages also overwrite the pending key.
    ///
    /// # Errors
    ///
    /// Returns the first encode or store error.
    pub async fn write(
        &self,
        update: &StateUpdate,
        written_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let bytes = Self::encode(&update.state)?;
        let key = Self::key_for(update, written_at);

        let retried_terminal = update.kind != UpdateKind::Pending && update.state.attempt_count > 1;
        if retried_terminal {
            self.objects
                .put(&Self::pending_key(update.message_id()), bytes.clone())
                .await?;
        }

        self.objects.put(&key, bytes).await?;
        Ok(())
    }

    /// Read every object under the pending prefix.
    ///
    /// Unreadable and undecodable objects are counted and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if listing fails.
    pub async fn load_pending(&self) -> Result<PendingScan, PersistenceError> {
        let mut scan = PendingScan::default();
        let mut continuation = None;

        loop {
            let page = self.objects.list(PENDING_PREFIX, continuation).await?;

            for key in &page.keys {
                let decoded = match self.objects.get(key).await {
                    Ok(bytes) => Self::decode(key, &bytes),
                    Err(err) => Err(err.into()),
                };
                match decoded {
                    Ok(state) => scan.states.push(state),
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "Skipping unreadable snapshot");
                        scan.malformed += 1;
                    },
                }
            }

            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        Ok(scan)
    }
}

fn key_segment(id: &MessageId) -> String {
    urlencoding::encode(id.as_str()).replace('.', "%2E")
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}
