//! # Sonos SDK - async control plane for Sonos speakers
//!
//! Finds players on the local network, invokes UPnP actions on them and
//! keeps an event-driven view of their state:
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use futures::StreamExt;
//! use sonos_sdk::SonosClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sonos_sdk::SdkError> {
//!     sonos_sdk::init_logging_from_env().ok();
//!
//!     let client = SonosClient::builder().start().await?;
//!     let devices = client.discover(Duration::from_secs(2)).await;
//!     let Some(device) = devices.first() else {
//!         return Ok(());
//!     };
//!
//!     // Control
//!     client
//!         .invoke(&device.uuid, "AVTransport", "Play", &[("InstanceID", "0"), ("Speed", "1")])
//!         .await?;
//!
//!     // Events
//!     client.subscribe(&device.uuid, "RenderingControl")?.wait_active().await?;
//!     let mut changes = client.property_changes();
//!     if let Some(change) = changes.next().await {
//!         println!("{} {} = {}", change.device, change.name, change.value);
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! sonos-sdk (SonosClient)
//!     ↓
//! sonos-state (DeviceRegistry, topology)
//!     ↓
//! sonos-stream (subscriptions, event processing) → callback-server
//!     ↓
//! sonos-discovery (SSDP, descriptions) → soap-client (SOAP, GENA, HTTP)
//! ```

// Main exports
pub use client::{SonosClient, SonosClientBuilder, ZONE_GROUP_TOPOLOGY};
pub use config::{ClientConfig, RetryPolicy};
pub use error::{Result, SdkError};

// Re-export commonly used types from the lower layers
pub use callback_server::CallbackConfig;
pub use soap_client::ActionResult;
pub use sonos_discovery::{DeviceDescriptor, DeviceUuid, DiscoveryConfig, ServiceDescriptor};
pub use sonos_state::{
    init_logging, init_logging_from_env, LoggingError, LoggingMode, PropertyChange,
    RegistryEvent, ZoneGroup, ZoneMember, ZoneTopology,
};
pub use sonos_stream::{
    ServiceRef, SubscriptionConfig, SubscriptionEvent, SubscriptionHandle, SubscriptionState,
};

// Internal modules
mod client;
mod config;
mod control;
mod error;
