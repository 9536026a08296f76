//! Gateway sync configuration.

use crate::error::{IotError, IotResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the gateway sync engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL for the Mycomize backend (e.g., "https://api.mycomize.com").
    pub api_base_url: String,

    /// Timeout applied to every backend and gateway request (seconds).
    pub request_timeout_secs: u64,

    /// Capacity of the channel carrying pushed gateway events.
    pub event_channel_capacity: usize,

    /// Backoff applied when an event subscription drops unexpectedly.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.mycomize.com".to_string(),
            request_timeout_secs: 30,
            event_channel_capacity: 256,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> IotResult<()> {
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(IotError::Config(format!(
                "api_base_url must be an http(s) URL, got {:?}",
                self.api_base_url
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(IotError::Config("request_timeout_secs must be positive".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(IotError::Config("event_channel_capacity must be positive".into()));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(IotError::Config(
                "reconnect.initial_delay_ms exceeds reconnect.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Exponential reconnect backoff for event subscriptions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt (milliseconds).
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay (milliseconds).
    pub max_delay_ms: u64,

    /// Reconnect attempts allowed before the connection is marked failed.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// Doubles from `initial_delay_ms` and saturates at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// How long a connected stream must stay up before its drop no longer
    /// counts as a failed attempt.
    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Returns true once `attempt` exceeds the allowed attempt count.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            max_attempts: 3,
        }
    }
}
