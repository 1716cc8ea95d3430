//! Internal event streaming and subscription management for sonos-sdk
//!
//! Keeps one GENA subscription alive per tracked (device, service) pair and
//! turns the NOTIFY requests devices send back into [`ServiceEvent`]s.
//!
//! - [`SubscriptionManager`] runs a task per subscription that subscribes,
//!   renews and resubscribes after the device forgets the SID.
//! - [`EventProcessor`] resolves NOTIFY payloads to their service and parses
//!   the property set.
//! - [`EventBroker`] wires both to a callback server.

pub mod broker;
pub mod error;
pub mod event;
pub mod manager;
pub mod processor;
pub mod types;

pub use broker::{EventBroker, EventBrokerBuilder};
pub use error::{BrokerError, EventProcessingError, Result, SubscriptionError};
pub use event::{EventSequence, ServiceEvent, SubscriptionEvent};
pub use manager::{SidTable, SubscriptionHandle, SubscriptionManager};
pub use processor::{EventProcessor, EventProcessorStats};
pub use types::{ServiceRef, SubscriptionConfig, SubscriptionState, MIN_RENEWAL_DELAY};
