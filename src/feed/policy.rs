//! Reconnect backoff and per-connection timing knobs

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with a cap and a bounded attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    ///
    /// `min(initial * 2^(attempt - 1), max)`, or `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub reconnect: ReconnectPolicy,
    /// Bound for the handshake and for `connect_and_wait` during resubscribe
    pub connect_timeout: Duration,
    /// Pause between subscribe batches
    pub subscribe_batch_delay: Duration,
    /// How often the staleness watchdog checks the last message time
    pub watchdog_interval: Duration,
    /// Raw messages logged per connection for debugging
    pub raw_message_log_limit: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            subscribe_batch_delay: Duration::from_millis(100),
            watchdog_interval: Duration::from_secs(5),
            raw_message_log_limit: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_up_to_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=10)
            .map(|n| policy.delay_for(n).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60, 60]);
    }

    #[test]
    fn test_delays_are_non_decreasing() {
        let policy = ReconnectPolicy::new(Duration::from_millis(300), Duration::from_secs(45), 40);
        let delays: Vec<Duration> = (1..=40).map_while(|n| policy.delay_for(n)).collect();
        assert_eq!(delays.len(), 40);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays.last(), Some(&Duration::from_secs(45)));
    }

    #[test]
    fn test_no_delay_past_budget() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(11), None);
        assert_eq!(policy.delay_for(0), None);
    }
}
