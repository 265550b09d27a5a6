//! Reconnect backoff schedule.

use std::time::Duration;

/// Exponential backoff for gateway reconnects: 3s, 6s, 12s, then capped at
/// 20s. The relay owns the timer; this only computes delays.
#[derive(Debug)]
pub struct RetryHandler {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            max: Duration::from_secs(20),
            attempts: 0,
        }
    }
}

impl RetryHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        self.attempts = self.attempts.saturating_add(1);
        (self.base.saturating_mul(factor)).min(self.max)
    }

    /// Forget past failures after a healthy connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
