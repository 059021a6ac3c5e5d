//! # SMS Retry Testing
//!
//! Testing utilities for the SMS retry engine.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - [`InMemoryObjectStore`]: `BTreeMap`-backed object store with failure injection
//! - [`ScriptedGateway`]: delivery gateway with per-message scripted outcomes
//!
//! ## Example
//!
//! ```ignore
//! use sms_retry_testing::{InMemoryObjectStore, ManualClock, ScriptedGateway};
//!
//! #[tokio::test]
//! async fn test_retry_flow() {
//!     let clock = ManualClock::at_test_epoch();
//!     let gateway = ScriptedGateway::rejecting();
//!     let store = InMemoryObjectStore::new();
//!     let engine = RetryEngine::new(config, env(&clock, &gateway, &store))?;
//!
//!     let id = engine.new_message(MessageRequest::new("+1555", "hi")).await?;
//!     clock.advance_millis(500);
//!     engine.wakeup();
//! }
//! ```

use chrono::{DateTime, Utc};
use sms_retry_core::environment::Clock;

/// Scripted delivery gateway
pub mod gateway_mocks;

/// In-memory object store
pub mod object_store_mocks;

/// Mock clocks for deterministic time
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use sms_retry_testing::mocks::FixedClock;
    /// use sms_retry_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when a test moves it
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the engine.
    ///
    /// # Example
    ///
    /// ```
    /// use sms_retry_testing::mocks::ManualClock;
    /// use sms_retry_core::environment::Clock;
    ///
    /// let clock = ManualClock::at_test_epoch();
    /// let start = clock.now();
    /// clock.advance_millis(500);
    /// assert_eq!((clock.now() - start).num_milliseconds(), 500);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Create a clock starting at the shared test epoch (see [`test_clock`])
        #[must_use]
        pub fn at_test_epoch() -> Self {
            Self::new(test_epoch())
        }

        /// Move the clock forward
        pub fn advance(&self, delta: chrono::Duration) {
            let mut time = self
                .time
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *time += delta;
        }

        /// Move the clock forward by `millis` milliseconds
        pub fn advance_millis(&self, millis: i64) {
            self.advance(chrono::Duration::milliseconds(millis));
        }

        /// Jump to an absolute time
        pub fn set(&self, time: DateTime<Utc>) {
            *self
                .time
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self
                .time
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// The shared test epoch, 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }
}

// Re-export commonly used items
pub use gateway_mocks::{ScriptedGateway, ScriptedOutcome};
pub use mocks::{FixedClock, ManualClock, test_clock, test_epoch};
pub use object_store_mocks::InMemoryObjectStore;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::at_test_epoch();
        let handle = clock.clone();

        handle.advance_millis(16_000);

        assert_eq!((clock.now() - test_epoch()).num_milliseconds(), 16_000);
    }

    #[test]
    fn test_epoch_matches_rfc3339() {
        let parsed = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(test_epoch(), parsed);
    }
}
