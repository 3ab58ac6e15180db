//! Escalating delays between reconnection attempts.

use std::time::Duration;

/// Delay sequence in seconds. Attempts past the end reuse the last value.
const DELAYS_SECS: [u64; 7] = [0, 1, 2, 4, 8, 16, 32];

/// Stateful iterator over the reconnect delay sequence.
#[derive(Debug, Default, Clone)]
pub struct ReconnectBackoff {
    attempt: usize,
}

impl ReconnectBackoff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before attempt number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(attempt: usize) -> Duration {
        let index = attempt.min(DELAYS_SECS.len() - 1);
        Duration::from_secs(DELAYS_SECS[index])
    }

    /// Returns the delay for the next attempt and advances.
    pub fn next_delay(&mut self) -> Duration {
        let delay = Self::delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempt
    }

    /// Restarts the sequence after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
