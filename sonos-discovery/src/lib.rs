//! Sonos device discovery library
//!
//! This crate discovers Sonos devices on a local network using SSDP
//! (Simple Service Discovery Protocol) and UPnP device descriptions.
//!
//! # Active search
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use futures::StreamExt;
//! use soap_client::HttpTransport;
//! use sonos_discovery::{search, DiscoveryConfig};
//!
//! # async fn run() {
//! let transport = Arc::new(HttpTransport::new());
//! let mut devices = search(transport, DiscoveryConfig::default(), Duration::from_secs(3));
//! while let Some(device) = devices.next().await {
//!     println!("Found {} at {}", device.friendly_name, device.base_url);
//! }
//! # }
//! ```
//!
//! # Passive listening
//!
//! [`DiscoveryListener`] joins the SSDP multicast group and reports devices
//! appearing and disappearing as [`DeviceEvent`]s.

pub mod device;
mod discovery;
mod error;
mod listener;
pub mod ssdp;

pub use device::describe;
pub use discovery::search;
pub use error::{DiscoveryError, Result};
pub use listener::DiscoveryListener;

use std::fmt;
use std::time::Duration;

/// Search target used for Sonos players.
pub const ZONE_PLAYER_TARGET: &str = "urn:schemas-upnp-org:device:ZonePlayer:1";

/// Unique device identifier, e.g. `RINCON_000E58A0123456`.
///
/// Built from a UDN (`uuid:RINCON_...`), a USN
/// (`uuid:RINCON_...::urn:...`) or a bare id; all three give the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceUuid(String);

impl DeviceUuid {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref().trim();
        let raw = raw.strip_prefix("uuid:").unwrap_or(raw);
        let raw = raw.split("::").next().unwrap_or(raw);
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceUuid {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for DeviceUuid {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// A UPnP service exposed by a device. URLs are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Full service type URN, e.g. `urn:schemas-upnp-org:service:AVTransport:1`
    pub service_type: String,
    pub service_id: String,
    pub control_url: String,
    pub event_sub_url: String,
}

impl ServiceDescriptor {
    /// Service name without the URN decoration, e.g. `AVTransport`.
    pub fn short_name(&self) -> &str {
        short_service_name(&self.service_type)
    }

    /// Matches either the full URN or the short name
    pub fn matches(&self, service_type: &str) -> bool {
        self.service_type == service_type || self.short_name() == service_type
    }
}

/// `urn:schemas-upnp-org:service:AVTransport:1` -> `AVTransport`.
/// Strings that are not service URNs are returned unchanged.
pub fn short_service_name(service_type: &str) -> &str {
    let parts: Vec<&str> = service_type.split(':').collect();
    match parts.as_slice() {
        [.., "service", name, _version] => *name,
        _ => service_type,
    }
}

/// Information about a discovered Sonos device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub uuid: DeviceUuid,
    /// Description document URL from SSDP `LOCATION`
    pub location: String,
    /// `scheme://host:port` of the location
    pub base_url: String,
    pub friendly_name: String,
    /// Room name where the device is located
    pub room_name: Option<String>,
    /// Model name (e.g., "Sonos One", "Sonos Play:1")
    pub model_name: Option<String>,
    /// Services of the device and its embedded devices
    pub services: Vec<ServiceDescriptor>,
}

impl DeviceDescriptor {
    /// First service matching a full URN or short name.
    pub fn service(&self, service_type: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.matches(service_type))
    }
}

/// Events emitted by the background [`DiscoveryListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device appeared, or re-advertised at a new location
    Found(DeviceDescriptor),
    /// A device said goodbye or its advertisement lease expired
    Lost(DeviceUuid),
}

/// Discovery tuning.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// SSDP search target
    pub search_target: String,
    /// MX value sent with M-SEARCH (maximum reply delay in seconds)
    pub mx: u8,
    /// How many times the M-SEARCH datagram is sent
    pub search_repeats: u8,
    /// Lease assumed when an advertisement carries no max-age
    pub default_max_age: Duration,
    /// How often the listener checks for expired leases
    pub sweep_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            search_target: ZONE_PLAYER_TARGET.to_string(),
            mx: 1,
            search_repeats: 2,
            default_max_age: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("uuid:RINCON_000E58A0123456", "RINCON_000E58A0123456")]
    #[case(
        "uuid:RINCON_000E58A0123456::urn:schemas-upnp-org:device:ZonePlayer:1",
        "RINCON_000E58A0123456"
    )]
    #[case("RINCON_000E58A0123456", "RINCON_000E58A0123456")]
    #[case(" uuid:RINCON_AAA ", "RINCON_AAA")]
    fn test_device_uuid_normalisation(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(DeviceUuid::new(raw).as_str(), expected);
    }

    #[rstest]
    #[case("urn:schemas-upnp-org:service:AVTransport:1", "AVTransport")]
    #[case("urn:schemas-sonos-com:service:Queue:1", "Queue")]
    #[case("AVTransport", "AVTransport")]
    fn test_short_service_name(#[case] service_type: &str, #[case] expected: &str) {
        assert_eq!(short_service_name(service_type), expected);
    }

    #[test]
    fn test_service_lookup() {
        let device = DeviceDescriptor {
            uuid: DeviceUuid::new("RINCON_AAA"),
            location: "http://10.0.0.2:1400/xml/device_description.xml".into(),
            base_url: "http://10.0.0.2:1400".into(),
            friendly_name: "Office".into(),
            room_name: None,
            model_name: None,
            services: vec![ServiceDescriptor {
                service_type: "urn:schemas-upnp-org:service:AVTransport:1".into(),
                service_id: "urn:upnp-org:serviceId:AVTransport".into(),
                control_url: "http://10.0.0.2:1400/MediaRenderer/AVTransport/Control".into(),
                event_sub_url: "http://10.0.0.2:1400/MediaRenderer/AVTransport/Event".into(),
            }],
        };

        assert!(device.service("AVTransport").is_some());
        assert!(device
            .service("urn:schemas-upnp-org:service:AVTransport:1")
            .is_some());
        assert!(device.service("RenderingControl").is_none());
    }
}
