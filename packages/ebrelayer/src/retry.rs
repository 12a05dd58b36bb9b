//! Exponential backoff for transient chain-read failures

use std::time::Duration;

use crate::config::WatcherConfig;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn from_watcher(config: &WatcherConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms),
            ..Self::default()
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt.min(64) as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Tracks consecutive failures of one operation
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Record a failure and return how long to wait before retrying
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.backoff_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Consecutive failures since the last success
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        };

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(10), Duration::from_secs(60)); // Capped
        assert_eq!(config.backoff_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_tracker_resets() {
        let mut backoff = Backoff::new(RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
            backoff_multiplier: 2.0,
        });

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_from_watcher_config() {
        let config = RetryConfig::from_watcher(&crate::config::test_config().watcher);
        assert_eq!(config.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
    }
}
