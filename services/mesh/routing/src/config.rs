//! Router configuration.

use mesh_wire::PeerId;
use std::time::Duration;

/// Restart policy for discovery roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Wait after the first attempt
    pub initial_delay: Duration,
    /// Upper bound for the wait between attempts
    pub max_delay: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl BackoffConfig {
    /// Wait after attempt `attempt` (1-based) before the next one
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Local peer identifier
    pub local_id: PeerId,
    /// Name sent in link handshakes
    pub local_name: String,
    /// Delay before re-broadcasting link state after a topology change
    pub broadcast_short_delay: Duration,
    /// Steady-state link-state broadcast interval
    pub broadcast_interval: Duration,
    /// Bound for each handshake step on a direct connection
    pub handshake_timeout: Duration,
    /// Bound for collecting end-to-end confirmations
    pub confirmation_timeout: Duration,
    /// Link cost used by an acceptor that knows no address of the initiator
    pub default_link_cost: u32,
    /// Restart policy for discovery roles
    pub supervision: BackoffConfig,
}

impl RouterConfig {
    /// Configuration with default timings
    pub fn new(local_id: PeerId, local_name: impl Into<String>) -> Self {
        Self {
            local_id,
            local_name: local_name.into(),
            broadcast_short_delay: Duration::from_secs(5),
            broadcast_interval: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            confirmation_timeout: Duration::from_secs(15),
            default_link_cost: 1,
            supervision: BackoffConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let backoff = BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 8,
        };
        let delays: Vec<u64> = (1..=6).map(|n| backoff.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_defaults() {
        let config = RouterConfig::new(PeerId::from_u128(1), "node");
        assert_eq!(config.broadcast_short_delay, Duration::from_secs(5));
        assert_eq!(config.broadcast_interval, Duration::from_secs(60));
        assert_eq!(config.default_link_cost, 1);
        assert_eq!(config.supervision.max_attempts, 8);
    }
}
