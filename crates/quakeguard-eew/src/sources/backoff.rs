//! Exponential reconnect backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay in ms (default: 1000)
    pub base_ms: u64,
    /// Upper bound on the delay in ms (default: 60000)
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
        }
    }
}

/// Doubling delay, capped, reset after a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff from its bounds
    pub fn new(config: &BackoffConfig) -> Self {
        let base = Duration::from_millis(config.base_ms.max(1));
        let max = Duration::from_millis(config.max_ms.max(config.base_ms.max(1)));
        Self {
            base,
            max,
            next: base,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; doubles the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        self.attempts += 1;
        delay
    }

    /// Failed attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Back to the base delay
    pub fn reset(&mut self) {
        self.next = self.base;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_then_caps() {
        let mut b = Backoff::new(&BackoffConfig {
            base_ms: 1_000,
            max_ms: 5_000,
        });
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
        assert_eq!(b.attempts(), 5);
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut b = Backoff::new(&BackoffConfig::default());
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }
}
