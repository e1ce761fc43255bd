//! Retry and backoff policy
//!
//! Client retries use a short exponential backoff widened for overload-type
//! failures. Supervisor respawns use a separate, much slower backoff so a
//! crashing server can't cause a restart storm.

use std::time::Duration;

use super::error::EmbeddingErrorKind;

/// Base delay before the first client retry
const BASE_DELAY: Duration = Duration::from_millis(100);

/// Multiplier applied for `TIMEOUT` / `SERVER_OVERLOAD`
const WIDEN_FACTOR: u32 = 5;

/// Client-side retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: BASE_DELAY,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// `base * 2^attempt`, widened for overload-type failures
    pub fn delay_for(&self, attempt: u32, kind: EmbeddingErrorKind) -> Duration {
        let delay = self.base_delay * 2u32.saturating_pow(attempt.min(16));
        if kind.widens_backoff() {
            delay * WIDEN_FACTOR
        } else {
            delay
        }
    }
}

/// Exponential gate for respawn attempts: 1s doubling to a 30s ceiling
#[derive(Debug, Clone)]
pub struct RespawnBackoff {
    current: Duration,
    initial: Duration,
    ceiling: Duration,
}

impl Default for RespawnBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RespawnBackoff {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            current: initial,
            initial,
            ceiling,
        }
    }

    /// Delay that must elapse after the last respawn before another one
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a respawn attempt, doubling the window
    pub fn bump(&mut self) {
        self.current = (self.current * 2).min(self.ceiling);
    }

    /// Server is healthy again
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_delays() {
        let config = RetryConfig::default();
        assert_eq!(
            config.delay_for(0, EmbeddingErrorKind::BrokenPipe),
            Duration::from_millis(100)
        );
        assert_eq!(
            config.delay_for(2, EmbeddingErrorKind::SocketClosed),
            Duration::from_millis(400)
        );
        assert_eq!(
            config.delay_for(1, EmbeddingErrorKind::Timeout),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_respawn_backoff_caps() {
        let mut backoff = RespawnBackoff::default();
        assert_eq!(backoff.current(), Duration::from_secs(1));
        for _ in 0..10 {
            backoff.bump();
        }
        assert_eq!(backoff.current(), Duration::from_secs(30));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn test_attempts_never_zero() {
        assert_eq!(RetryConfig::new(0).max_attempts, 1);
    }
}
