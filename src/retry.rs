//! Bounded retry expressed as an explicit state machine.
//!
//! ```text
//! Attempting(n) --ok--> done
//! Attempting(n) --retryable error, n < max--> Waiting(n) --delay--> Attempting(n + 1)
//! Attempting(n) --retryable error, n = max--> Exhausted
//! Attempting(n) --other error--> done
//! ```
//!
//! [`ConcurrencyPool::run_retrying`](crate::pool::ConcurrencyPool::run_retrying)
//! keeps one state per queued unit and advances it with
//! [`RetryPolicy::after_failure`].

use std::time::Duration;

/// Fixed-count, fixed-delay retry schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay between consecutive attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(1500))
    }
}

/// Where a retried operation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting(u32),
    Waiting { attempt: u32, delay: Duration },
    Exhausted,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Delay to wait after the given (1-based) attempt failed.
    pub fn delay_for(&self, _attempt: u32) -> Duration {
        self.backoff
    }

    /// State to move to after attempt `attempt` failed with a retryable error.
    pub fn after_failure(&self, attempt: u32) -> RetryState {
        if attempt < self.max_attempts.max(1) {
            RetryState::Waiting {
                attempt,
                delay: self.delay_for(attempt),
            }
        } else {
            RetryState::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUICK: RetryPolicy = RetryPolicy::fixed(3, Duration::from_millis(1));

    #[test]
    fn schedule_transitions() {
        assert_eq!(
            QUICK.after_failure(1),
            RetryState::Waiting {
                attempt: 1,
                delay: Duration::from_millis(1)
            }
        );
        assert_eq!(QUICK.after_failure(3), RetryState::Exhausted);
    }
}
