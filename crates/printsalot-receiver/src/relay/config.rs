//! Relay client configuration.

use std::time::Duration;

/// Configuration for the receiver's connection to the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,

    /// Upper bound for one connect attempt (TCP + TLS + Socket.IO handshake).
    pub connect_timeout: Duration,

    /// Capacity of the command queue between handles and the session task.
    pub command_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(15),
            command_buffer: 64,
        }
    }
}

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt, and the value the delay
    /// resets to after a successful connect.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after an attempt that waited `current` and failed.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current
            .checked_mul(self.multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
