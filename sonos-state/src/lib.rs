//! Sonos State Management
//!
//! The in-memory view of a household: which players exist, the last evented
//! value of each of their service properties and how they are grouped.
//!
//! # Architecture
//!
//! ```text
//! EventBroker → ServiceEvent → event worker → DeviceRegistry → PropertyChange
//!                                             (queries)        RegistryEvent
//! ```
//!
//! Updates are ordered per property by `(SID, SEQ)`: a delivery only
//! overwrites a stored value if it is newer within the same subscription,
//! and deliveries from a superseded subscription are always dropped.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sonos_state::{spawn_state_event_worker, DeviceRegistry};
//!
//! let registry = Arc::new(DeviceRegistry::new());
//! let mut found = sonos_discovery::search(transport, DiscoveryConfig::default(), timeout);
//! while let Some(device) = found.next().await {
//!     registry.upsert(device);
//! }
//!
//! let events = broker.event_stream().expect("event stream already taken");
//! spawn_state_event_worker(Arc::clone(&registry), events);
//!
//! let mut changes = registry.property_changes();
//! while let Ok(change) = changes.recv().await {
//!     println!("{} {} = {}", change.device, change.name, change.value);
//! }
//! ```

// Core modules
pub mod registry;
pub mod topology;

// Applies broker events to the registry
pub mod event_worker;

// Error types
pub mod error;

// Logging infrastructure
pub mod logging;

// ============================================================================
// Re-exports
// ============================================================================

pub use registry::{
    DeviceRegistry, PropertyChange, RegistryEvent, UpdateOutcome, UpsertOutcome, ZONE_GROUP_STATE,
};

pub use topology::{parse_zone_group_state, ZoneGroup, ZoneMember, ZoneTopology};

pub use event_worker::spawn_state_event_worker;

pub use error::{Result, StateError};

pub use logging::{init_logging, init_logging_from_env, is_initialized, LoggingError, LoggingMode};
