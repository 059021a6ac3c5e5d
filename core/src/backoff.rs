//! Fixed retry schedule, measured from a message's arrival time.
//!
//! Every attempt is due at a fixed offset from arrival rather than from the
//! previous attempt, so a slow attempt never pushes later attempts back.
//!
//! | attempt | delay from arrival |
//! |---------|--------------------|
//! | 1       | 0 ms (inline)      |
//! | 2       | 500 ms             |
//! | 3       | 2 000 ms           |
//! | 4       | 4 000 ms           |
//! | 5       | 8 000 ms           |
//! | 6       | 16 000 ms          |

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Highest attempt number. A message that fails this attempt is `FAILED`.
pub const MAX_ATTEMPTS: u32 = 6;

/// Errors from the backoff policy.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffError {
    /// Attempt number outside `1..=MAX_ATTEMPTS`.
    ///
    /// Correct engine logic never produces this; it guards against
    /// programming errors and corrupted state.
    #[error("attempt number must be within 1..={max}, got {0}", max = MAX_ATTEMPTS)]
    InvalidAttempt(u32),
}

/// Delay from arrival at which `attempt` becomes due.
///
/// # Errors
///
/// Returns [`BackoffError::InvalidAttempt`] for any attempt outside `1..=6`.
pub const fn delay_from_arrival(attempt: u32) -> Result<Duration, BackoffError> {
    let millis = match attempt {
        1 => 0,
        2 => 500,
        3 => 2_000,
        4 => 4_000,
        5 => 8_000,
        6 => 16_000,
        _ => return Err(BackoffError::InvalidAttempt(attempt)),
    };
    Ok(Duration::from_millis(millis))
}

/// Absolute due time of `attempt` for a message that arrived at `arrival`.
///
/// # Errors
///
/// Returns [`BackoffError::InvalidAttempt`] for any attempt outside `1..=6`.
pub fn due_at(arrival: DateTime<Utc>, attempt: u32) -> Result<DateTime<Utc>, BackoffError> {
    let delay = delay_from_arrival(attempt)?;
    // Table values are small constants, the conversion cannot overflow
    let delay = chrono::Duration::milliseconds(i64::try_from(delay.as_millis()).unwrap_or(0));
    Ok(arrival + delay)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_table() {
        let expected = [0, 500, 2_000, 4_000, 8_000, 16_000];
        for (attempt, millis) in (1..=MAX_ATTEMPTS).zip(expected) {
            assert_eq!(
                delay_from_arrival(attempt),
                Ok(Duration::from_millis(millis)),
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn test_out_of_range_attempts_rejected() {
        assert_eq!(delay_from_arrival(0), Err(BackoffError::InvalidAttempt(0)));
        assert_eq!(delay_from_arrival(7), Err(BackoffError::InvalidAttempt(7)));
        assert_eq!(
            delay_from_arrival(u32::MAX),
            Err(BackoffError::InvalidAttempt(u32::MAX))
        );
    }

    #[test]
    fn test_due_at_is_relative_to_arrival() {
        let arrival = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(due_at(arrival, 1).unwrap(), arrival);
        assert_eq!(
            due_at(arrival, 6).unwrap(),
            arrival + chrono::Duration::seconds(16)
        );
        assert!(due_at(arrival, 0).is_err());
    }

    proptest! {
        #[test]
        fn prop_schedule_strictly_increasing(attempt in 1u32..MAX_ATTEMPTS) {
            let current = delay_from_arrival(attempt).unwrap();
            let next = delay_from_arrival(attempt + 1).unwrap();
            prop_assert!(next > current);
        }

        #[test]
        fn prop_only_valid_range_accepted(attempt in any::<u32>()) {
            let valid = (1..=MAX_ATTEMPTS).contains(&attempt);
            prop_assert_eq!(delay_from_arrival(attempt).is_ok(), valid);
        }
    }
}
