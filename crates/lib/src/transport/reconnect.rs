//! Exponential reconnect backoff for client-dialed connections.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Delay before reconnect attempt number `attempt` (zero-based):
/// `min(min_delay * 2^attempt, max_delay)`.
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let delay = config.min_delay_ms.saturating_mul(factor);
    Duration::from_millis(delay.min(config.max_delay_ms))
}

/// Counts consecutive failed attempts and hands out delays until the cap.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once `max_attempts`
    /// attempts have been scheduled.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = backoff_delay(&self.config, self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.config.max_attempts
    }
}
