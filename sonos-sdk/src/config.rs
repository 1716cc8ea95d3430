//! Client configuration

use std::time::Duration;

use callback_server::CallbackConfig;
use sonos_discovery::DiscoveryConfig;
use sonos_stream::SubscriptionConfig;

/// Retry behaviour for SOAP actions.
///
/// Only transport failures and malformed responses are retried; a SOAP
/// fault is the device's final answer.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(32) as i32);
        let delay_ms = self.initial_backoff.as_millis() as f64 * factor;
        if delay_ms >= self.max_backoff.as_millis() as f64 {
            self.max_backoff
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Configuration for [`SonosClient`](crate::SonosClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub discovery: DiscoveryConfig,
    pub subscription: SubscriptionConfig,
    pub callback: CallbackConfig,
    pub retry: RetryPolicy,
    /// Timeout for actions invoked without an explicit one
    pub default_action_timeout: Duration,
    /// Follow SSDP advertisements in the background
    pub run_discovery_listener: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            subscription: SubscriptionConfig::default(),
            callback: CallbackConfig::default(),
            retry: RetryPolicy::default(),
            default_action_timeout: Duration::from_secs(5),
            run_discovery_listener: false,
        }
    }
}
