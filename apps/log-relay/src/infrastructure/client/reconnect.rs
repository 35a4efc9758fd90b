//! Reconnection Policy
//!
//! Decides how long the viewer waits before reconnecting to the relay:
//! a fixed delay, optionally with a limit on consecutive attempts.

use std::time::Duration;

/// Default delay between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before each retry.
    pub delay: Duration,
    /// Maximum number of attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY, 0)
    }
}

impl ReconnectConfig {
    /// Fixed delay between attempts.
    #[must_use]
    pub const fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }
}

/// Tracks attempts and produces retry delays.
///
/// # Example
///
/// ```rust
/// use log_relay::infrastructure::client::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_millis(3000), 2));
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(3000)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(3000)));
/// assert_eq!(policy.next_delay(), None);
///
/// // A successful connection starts the count over
/// policy.reset();
/// assert!(policy.should_retry());
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub const fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempt_count += 1;
        Some(self.config.delay)
    }

    /// Reset after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_fixed_three_seconds_unlimited() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());

        for _ in 0..100 {
            assert_eq!(policy.next_delay(), Some(Duration::from_millis(3000)));
        }
        assert!(policy.should_retry());
        assert_eq!(policy.attempt_count(), 100);
    }

    #[test]
    fn max_attempts_is_enforced() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_millis(10), 3));

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
    }

    #[test]
    fn reset_restores_attempts() {
        let mut policy =
            ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_millis(100), 2));
        policy.next_delay();
        policy.next_delay();
        assert!(!policy.should_retry());

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }
}
