//! Reconnection backoff.
//!
//! Exponential delay over consecutive failed attempts, reset on a
//! successful open. After the attempt budget is spent the controller stops
//! yielding delays; callers must surface that as an explicit failed state
//! rather than silently giving up.

use std::time::Duration;

use crate::protocol::is_terminal_close;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(16_000),
            max_attempts: 5,
        }
    }
}

#[derive(Debug)]
pub struct BackoffController {
    policy: BackoffPolicy,
    attempt: u32,
}

impl BackoffController {
    pub fn new(policy: BackoffPolicy) -> Self {
        BackoffController { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` when the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let shift = self.attempt.min(20);
        let delay = self
            .policy
            .base
            .saturating_mul(1u32 << shift)
            .min(self.policy.cap);
        self.attempt += 1;
        Some(delay)
    }

    /// Call on a successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Whether a close with this code is worth retrying at all. Intentional
    /// closes are filtered out by the caller before this is consulted.
    pub fn should_retry(close_code: Option<u16>) -> bool {
        match close_code {
            Some(code) => !is_terminal_close(code),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap_then_stop() {
        let mut backoff = BackoffController::new(BackoffPolicy::default());
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn reset_restores_the_full_budget() {
        let mut backoff = BackoffController::new(BackoffPolicy::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn cap_holds_for_large_attempt_counts() {
        let mut backoff = BackoffController::new(BackoffPolicy {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(16_000),
            max_attempts: 50,
        });
        let last = std::iter::from_fn(|| backoff.next_delay()).last().unwrap();
        assert_eq!(last, Duration::from_millis(16_000));
    }

    #[test]
    fn terminal_close_codes_are_not_retried() {
        assert!(BackoffController::should_retry(None));
        assert!(BackoffController::should_retry(Some(1006)));
        assert!(!BackoffController::should_retry(Some(1000)));
        assert!(!BackoffController::should_retry(Some(4001)));
        assert!(!BackoffController::should_retry(Some(4004)));
    }
}
