//! # SMS Retry Core
//!
//! Core types and capability traits for the SMS retry engine.
//!
//! This crate has no runtime of its own. It defines:
//!
//! - **Message model**: [`Message`], [`MessageState`], [`StateUpdate`], [`MessageSummary`]
//! - **Backoff policy**: the fixed, arrival-relative retry schedule ([`backoff`])
//! - **Capabilities**: [`SendGateway`] (delivery transport) and [`ObjectStore`]
//!   (durable key-addressed blob storage), both dyn-compatible
//! - **Environment**: the [`Clock`](environment::Clock) abstraction for testable time
//!
//! ## Lifecycle of a message
//!
//! ```text
//!   arrival ──► PENDING (attempt 0)
//!                  │ attempt 1 inline
//!                  ├──────────────► SUCCESS
//!                  │ failed
//!                  ▼
//!               PENDING, due = arrival + backoff(n + 1)
//!                  │ attempts 2..6 on tick
//!                  ├──────────────► SUCCESS
//!                  └──────────────► FAILED (after attempt 6)
//! ```
//!
//! ## Example
//!
//! ```
//! use sms_retry_core::backoff;
//! use std::time::Duration;
//!
//! assert_eq!(backoff::delay_from_arrival(2), Ok(Duration::from_millis(500)));
//! assert!(backoff::delay_from_arrival(7).is_err());
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Fixed, arrival-relative backoff schedule
pub mod backoff;

/// Delivery transport capability
pub mod gateway;

/// Message, state and snapshot types
pub mod message;

/// Durable key-addressed blob storage capability
pub mod object_store;

pub use backoff::{BackoffError, MAX_ATTEMPTS};
pub use gateway::{SendError, SendGateway};
pub use message::{
    AttemptOutcome, EXHAUSTED_REASON, Message, MessageId, MessageRequest, MessageState,
    MessageStatus, MessageSummary, StateUpdate, UpdateKind,
};
pub use object_store::{ListPage, ObjectStore, ObjectStoreError};

/// Environment module - injected dependencies that are not capabilities
///
/// Time is injected rather than read from the system so that backoff
/// schedules can be exercised deterministically in tests.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use sms_retry_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
