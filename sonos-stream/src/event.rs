//! Event types for the sonos-stream crate.

use soap_client::PropertySet;

use crate::types::ServiceRef;

/// Position of a delivery within a subscription's event stream.
///
/// `seq` numbering restarts at 0 for every new SID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSequence {
    pub subscription_id: String,
    pub seq: u32,
}

impl EventSequence {
    pub fn new(subscription_id: impl Into<String>, seq: u32) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            seq,
        }
    }
}

/// Parsed NOTIFY delivery for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub service: ServiceRef,
    pub sequence: EventSequence,
    pub properties: PropertySet,
}

/// Subscription lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// Subscription successfully established.
    Established {
        service: ServiceRef,
        subscription_id: String,
    },

    /// Subscription successfully renewed.
    Renewed {
        service: ServiceRef,
        subscription_id: String,
    },

    /// The device no longer honours the subscription. A fresh SUBSCRIBE
    /// follows automatically while the service stays tracked.
    Lost {
        service: ServiceRef,
        subscription_id: String,
        reason: String,
    },

    /// Subscription removed (untracked).
    Ended { service: ServiceRef },
}

impl SubscriptionEvent {
    pub fn service(&self) -> &ServiceRef {
        match self {
            SubscriptionEvent::Established { service, .. }
            | SubscriptionEvent::Renewed { service, .. }
            | SubscriptionEvent::Lost { service, .. }
            | SubscriptionEvent::Ended { service } => service,
        }
    }
}
