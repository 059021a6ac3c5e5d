//! Message, per-message state and persisted snapshot types.

use crate::backoff::{self, BackoffError, MAX_ATTEMPTS};
use crate::gateway::SendError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Reason recorded on a message that failed every attempt without an error text.
pub const EXHAUSTED_REASON: &str = "all retries exhausted";

/// Unique identifier of a message.
///
/// Either supplied by the caller or generated by the engine on arrival.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create a new message ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hash of the identifier that is identical across processes and releases.
    ///
    /// Shard routing and persisted key partitions are derived from this value,
    /// so it must never change for a given identifier.
    #[must_use]
    pub fn stable_hash(&self) -> u64 {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }

    /// Bucket in `0..buckets` for this identifier (`buckets` of 0 is treated as 1).
    #[must_use]
    pub fn bucket(&self, buckets: usize) -> usize {
        let buckets = u64::try_from(buckets.max(1)).unwrap_or(u64::MAX);
        // Result is < buckets, which came from a usize
        usize::try_from(self.stable_hash() % buckets).unwrap_or(0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Arrival request: a message whose identifier may still be missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequest {
    /// Caller-supplied identifier; blank or `None` lets the engine generate one.
    pub id: Option<MessageId>,
    /// Destination address (phone number).
    pub destination: String,
    /// Message text.
    pub body: String,
}

impl MessageRequest {
    /// Request without an identifier.
    #[must_use]
    pub fn new(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: None,
            destination: destination.into(),
            body: body.into(),
        }
    }

    /// Attach a caller-supplied identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The caller-supplied identifier, ignoring blank ones.
    #[must_use]
    pub fn supplied_id(&self) -> Option<&MessageId> {
        self.id.as_ref().filter(|id| !id.as_str().trim().is_empty())
    }
}

/// An immutable message handed to the delivery gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier.
    pub id: MessageId,
    /// Destination address (phone number).
    pub destination: String,
    /// Message text.
    pub body: String,
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Still retrying.
    Pending,
    /// Delivered; terminal.
    Success,
    /// Every attempt failed; terminal.
    Failed,
}

impl MessageStatus {
    /// Status name as persisted and reported.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    /// `SUCCESS` or `FAILED`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of applying one delivery attempt to a pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The attempt succeeded; the state is now `SUCCESS`.
    Delivered,
    /// The last allowed attempt failed; the state is now `FAILED`.
    Exhausted,
    /// The attempt failed; the next attempt is due at `due_at`.
    Rescheduled {
        /// Absolute due time of the next attempt.
        due_at: DateTime<Utc>,
    },
}

/// Live delivery state of one message.
///
/// Owned by exactly one scheduler shard. The persisted JSON form carries every
/// field, so a snapshot can be loaded back into an identical state.
///
/// # Invariants
///
/// - `attempt_count` never exceeds [`MAX_ATTEMPTS`]
/// - status only moves `PENDING → SUCCESS` or `PENDING → FAILED`
/// - `next_due_at` is `None` and `finalized_at` is `Some` once terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageState {
    /// Message identifier.
    pub message_id: MessageId,
    /// Attempts executed so far (0 before the inline first attempt).
    pub attempt_count: u32,
    /// Arrival time; all backoff delays are measured from here.
    pub arrival_at: DateTime<Utc>,
    /// Due time of the next attempt while pending.
    #[serde(default)]
    pub next_due_at: Option<DateTime<Utc>>,
    /// Delivery status.
    pub status: MessageStatus,
    /// Last error reported by the gateway, if any.
    #[serde(default)]
    pub last_error: Option<String>,
    /// When the message reached a terminal status.
    #[serde(default)]
    pub finalized_at: Option<DateTime<Utc>>,
    /// Destination address.
    pub destination: String,
    /// Message text.
    pub body: String,
}

impl MessageState {
    /// Fresh `PENDING` state with no attempts, arriving at `now`.
    #[must_use]
    pub fn new(message: Message, now: DateTime<Utc>) -> Self {
        Self {
            message_id: message.id,
            attempt_count: 0,
            arrival_at: now,
            next_due_at: None,
            status: MessageStatus::Pending,
            last_error: None,
            finalized_at: None,
            destination: message.destination,
            body: message.body,
        }
    }

    /// The immutable message this state tracks.
    #[must_use]
    pub fn to_message(&self) -> Message {
        Message {
            id: self.message_id.clone(),
            destination: self.destination.clone(),
            body: self.body.clone(),
        }
    }

    /// `true` while the message is still being retried.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }

    /// Time used to order history entries, newest first.
    ///
    /// Finalization time for terminal states; a pending state falls back to
    /// its due time, then to its arrival time.
    #[must_use]
    pub fn recency(&self) -> DateTime<Utc> {
        self.finalized_at
            .or(self.next_due_at)
            .unwrap_or(self.arrival_at)
    }

    /// Record the result of attempt number `attempt` executed at `now`.
    ///
    /// A gateway error counts as a failed attempt and becomes the last error.
    /// On failure before the last attempt the next due time is computed from
    /// arrival, never from `now`.
    ///
    /// # Errors
    ///
    /// Returns [`BackoffError::InvalidAttempt`] if `attempt` is outside
    /// `1..=MAX_ATTEMPTS`; the state is left untouched in that case.
    pub fn apply_attempt(
        &mut self,
        attempt: u32,
        result: Result<bool, SendError>,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, BackoffError> {
        backoff::delay_from_arrival(attempt)?;

        let delivered = match result {
            Ok(delivered) => delivered,
            Err(err) => {
                self.last_error = Some(err.to_string());
                false
            },
        };
        self.attempt_count = attempt;

        if delivered {
            self.finish(MessageStatus::Success, now);
            return Ok(AttemptOutcome::Delivered);
        }

        if attempt >= MAX_ATTEMPTS {
            self.finish(MessageStatus::Failed, now);
            self.last_error
                .get_or_insert_with(|| EXHAUSTED_REASON.to_string());
            return Ok(AttemptOutcome::Exhausted);
        }

        let due_at = backoff::due_at(self.arrival_at, attempt + 1)?;
        self.next_due_at = Some(due_at);
        Ok(AttemptOutcome::Rescheduled { due_at })
    }

    fn finish(&mut self, status: MessageStatus, now: DateTime<Utc>) {
        self.status = status;
        self.next_due_at = None;
        self.finalized_at = Some(now);
    }
}

/// Kind of a state update, which also selects its storage namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    /// Message is still retrying; stored where recovery scans.
    Pending,
    /// Message was delivered; stored in the audit history.
    Success,
    /// Message exhausted its attempts; stored in the audit history.
    Failed,
}

impl UpdateKind {
    /// Namespace segment used in storage keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Point-in-time snapshot of a state, tagged for persistence.
///
/// This is a copy, not an alias of the live state: later mutations of the
/// live state do not affect an update already handed to the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    /// Update kind.
    pub kind: UpdateKind,
    /// Snapshot of the state at emission time.
    pub state: MessageState,
}

impl StateUpdate {
    /// Snapshot of a still-pending state.
    #[must_use]
    pub fn pending(state: &MessageState) -> Self {
        Self {
            kind: UpdateKind::Pending,
            state: state.clone(),
        }
    }

    /// Snapshot of a delivered state.
    #[must_use]
    pub fn success(state: &MessageState) -> Self {
        Self {
            kind: UpdateKind::Success,
            state: state.clone(),
        }
    }

    /// Snapshot of an exhausted state.
    #[must_use]
    pub fn failed(state: &MessageState) -> Self {
        Self {
            kind: UpdateKind::Failed,
            state: state.clone(),
        }
    }

    /// Snapshot tagged by the state's current status.
    #[must_use]
    pub fn of(state: &MessageState) -> Self {
        match state.status {
            MessageStatus::Pending => Self::pending(state),
            MessageStatus::Success => Self::success(state),
            MessageStatus::Failed => Self::failed(state),
        }
    }

    /// Identifier of the snapshotted message.
    #[must_use]
    pub fn message_id(&self) -> &MessageId {
        &self.state.message_id
    }
}

/// Read-model row returned by history queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    /// Message identifier.
    pub message_id: MessageId,
    /// Attempts executed.
    pub attempt_count: u32,
    /// Delivery status.
    pub status: MessageStatus,
    /// Finalization time (see [`MessageState::recency`]).
    pub final_timestamp: DateTime<Utc>,
    /// Last error, if any.
    pub reason: Option<String>,
}

impl From<&MessageState> for MessageSummary {
    fn from(state: &MessageState) -> Self {
        Self {
            message_id: state.message_id.clone(),
            attempt_count: state.attempt_count,
            status: state.status,
            final_timestamp: state.recency(),
            reason: state.last_error.clone(),
        }
    }
}
