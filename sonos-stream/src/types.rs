//! Core types for the sonos-stream crate.

use std::fmt;
use std::time::Duration;

use sonos_discovery::{short_service_name, DeviceUuid};

/// Reference to one service on one device.
///
/// Held by identifier only, so it stays valid while the device itself comes
/// and goes from the registry.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ServiceRef {
    /// The device exposing the service
    pub device: DeviceUuid,
    /// Full service type URN
    pub service_type: String,
}

impl ServiceRef {
    pub fn new(device: impl Into<DeviceUuid>, service_type: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            service_type: service_type.into(),
        }
    }

    /// Service name without the URN prefix and version, e.g. `AVTransport`
    pub fn short_name(&self) -> &str {
        short_service_name(&self.service_type)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.short_name())
    }
}

/// Lifecycle of a tracked subscription.
///
/// ```text
/// Unsubscribed -> Subscribing -> Active -> Renewing -> Active ...
///                      ^                      |
///                      +------- Failed <------+
/// ```
/// Any state moves to `Unsubscribed` when the subscription is untracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active { sid: String },
    Renewing { sid: String },
    Failed { reason: String },
}

impl SubscriptionState {
    /// SID of the live subscription, if any
    pub fn sid(&self) -> Option<&str> {
        match self {
            SubscriptionState::Active { sid } | SubscriptionState::Renewing { sid } => Some(sid),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionState::Active { .. })
    }
}

/// Shortest wait between renewals, even for tiny granted timeouts.
pub const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

/// Configuration for subscription maintenance.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Duration asked for in SUBSCRIBE and renewal requests
    pub requested_timeout: Duration,
    /// Fraction of the granted timeout after which the subscription is renewed
    pub renewal_fraction: f64,
    /// Renewal attempts before the subscription is declared lost
    pub renewal_attempts: u32,
    /// Base duration for exponential backoff between retries
    pub retry_backoff_base: Duration,
    /// Upper bound on the wait between failed SUBSCRIBE attempts
    pub resubscribe_backoff_max: Duration,
    /// Size of the event buffer channels
    pub event_buffer_size: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            requested_timeout: Duration::from_secs(1800), // 30 minutes
            renewal_fraction: 2.0 / 3.0,
            renewal_attempts: 3,
            retry_backoff_base: Duration::from_secs(2),
            resubscribe_backoff_max: Duration::from_secs(60),
            event_buffer_size: 100,
        }
    }
}

impl SubscriptionConfig {
    /// Delay after which a subscription granted for `granted` is renewed.
    ///
    /// Never shorter than [`MIN_RENEWAL_DELAY`], whatever the device grants.
    pub fn renewal_delay(&self, granted: Duration) -> Duration {
        let fraction = self.renewal_fraction.clamp(0.05, 1.0);
        granted.mul_f64(fraction).max(MIN_RENEWAL_DELAY)
    }

    /// Wait before retry number `attempt` (0-based), doubling from the base.
    pub fn backoff(&self, attempt: u32, cap: Duration) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.retry_backoff_base.saturating_mul(factor).min(cap)
    }
}
