//! Device description parsing and validation.
//!
//! This module handles parsing UPnP device description XML and validating
//! that devices are Sonos speakers. Services of embedded devices (Sonos puts
//! AVTransport and RenderingControl under an embedded MediaRenderer) are
//! flattened into the root device's service list.

use serde::Deserialize;
use soap_client::{HttpMethod, HttpRequest, Transport};
use std::time::Duration;
use url::Url;

use crate::error::{DiscoveryError, Result};
use crate::{DeviceDescriptor, DeviceUuid, ServiceDescriptor};

/// Timeout for a single description fetch.
pub const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(5);

/// UPnP device description root element.
#[derive(Debug, Deserialize)]
pub struct Root {
    pub device: DeviceDescription,
}

/// Internal device description parsed from XML.
///
/// Unknown elements are ignored, so vendor extensions do not break parsing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescription {
    pub device_type: String,
    pub friendly_name: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(rename = "UDN")]
    pub udn: String,
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub service_list: Option<ServiceList>,
    #[serde(default)]
    pub device_list: Option<DeviceList>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceList {
    #[serde(rename = "service", default)]
    pub services: Vec<ServiceElement>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceList {
    #[serde(rename = "device", default)]
    pub devices: Vec<DeviceDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceElement {
    pub service_type: String,
    pub service_id: String,
    #[serde(rename = "controlURL")]
    pub control_url: String,
    #[serde(rename = "eventSubURL")]
    pub event_sub_url: String,
}

impl DeviceDescription {
    /// Parse device description from XML.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::ParseError` if the XML is malformed or missing required fields.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let root: Root = quick_xml::de::from_str(xml)
            .map_err(|e| DiscoveryError::ParseError(format!("Failed to parse device XML: {}", e)))?;

        Ok(root.device)
    }

    /// Check if this device is a Sonos device.
    ///
    /// Validates by checking manufacturer name and device type.
    pub fn is_sonos_device(&self) -> bool {
        self.manufacturer
            .as_deref()
            .map(|m| m.to_lowercase().contains("sonos"))
            .unwrap_or(false)
            || self.device_type.contains("ZonePlayer")
    }

    /// Services of this device followed by those of its embedded devices,
    /// depth first.
    pub fn all_services(&self) -> Vec<&ServiceElement> {
        let mut services: Vec<&ServiceElement> = self
            .service_list
            .iter()
            .flat_map(|list| list.services.iter())
            .collect();
        for embedded in self.device_list.iter().flat_map(|list| list.devices.iter()) {
            services.extend(embedded.all_services());
        }
        services
    }

    /// Convert to the public descriptor, resolving service URLs against
    /// the description's location.
    pub fn into_descriptor(self, location: &str) -> Result<DeviceDescriptor> {
        let location_url = Url::parse(location)
            .map_err(|e| DiscoveryError::InvalidDevice(format!("Bad location {}: {}", location, e)))?;
        let root = location_url
            .join("/")
            .map_err(|e| DiscoveryError::InvalidDevice(e.to_string()))?;
        let base_url = root.as_str().trim_end_matches('/').to_string();

        let uuid = DeviceUuid::new(&self.udn);
        if uuid.as_str().is_empty() {
            return Err(DiscoveryError::InvalidDevice("Empty UDN".to_string()));
        }

        let services = self
            .all_services()
            .into_iter()
            .map(|service| {
                Ok(ServiceDescriptor {
                    service_type: service.service_type.trim().to_string(),
                    service_id: service.service_id.trim().to_string(),
                    control_url: resolve(&root, &service.control_url)?,
                    event_sub_url: resolve(&root, &service.event_sub_url)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(DeviceDescriptor {
            uuid,
            location: location.to_string(),
            base_url,
            friendly_name: self.friendly_name,
            room_name: self.room_name,
            model_name: self.model_name,
            services,
        })
    }
}

fn resolve(root: &Url, path: &str) -> Result<String> {
    root.join(path.trim())
        .map(String::from)
        .map_err(|e| DiscoveryError::InvalidDevice(format!("Bad service URL {}: {}", path, e)))
}

/// Fetch and parse the description document at `location`.
///
/// # Errors
///
/// `DeviceUnreachable` when the fetch fails, `ParseError` for malformed XML,
/// `InvalidDevice` for a device that is not a Sonos player.
pub async fn describe(transport: &dyn Transport, location: &str) -> Result<DeviceDescriptor> {
    let request = HttpRequest::new(HttpMethod::Get, location).timeout(DESCRIPTION_TIMEOUT);
    let response = transport
        .execute(request)
        .await
        .map_err(|e| DiscoveryError::DeviceUnreachable {
            location: location.to_string(),
            reason: e.to_string(),
        })?;

    if !response.is_success() {
        return Err(DiscoveryError::DeviceUnreachable {
            location: location.to_string(),
            reason: format!("HTTP {}", response.status),
        });
    }

    let description = DeviceDescription::from_xml(&response.body)?;
    if !description.is_sonos_device() {
        return Err(DiscoveryError::InvalidDevice(format!(
            "{} is not a Sonos device",
            description.device_type
        )));
    }

    description.into_descriptor(location)
}
