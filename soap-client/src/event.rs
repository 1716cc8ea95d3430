//! GENA event body parsing.
//!
//! A NOTIFY body is a `propertyset` of evented variables. AVTransport and
//! RenderingControl pack their state into a single `LastChange` variable
//! holding an escaped XML document; that document is expanded here so
//! consumers see one flat list of properties either way.

use tracing::warn;
use xmltree::Element;

use crate::envelope::{child_elements, element_text};
use crate::error::SoapError;

/// Name of the variable carrying a nested change document.
pub const LAST_CHANGE: &str = "LastChange";

/// Flat list of evented properties in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySet {
    properties: Vec<(String, String)>,
}

impl PropertySet {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    fn push(&mut self, name: String, value: String) {
        self.properties.push((name, value));
    }
}

impl IntoIterator for PropertySet {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.properties.into_iter()
    }
}

/// Property key for a channelled variable, e.g. `Volume/Master`.
pub fn channel_key(name: &str, channel: &str) -> String {
    format!("{}/{}", name, channel)
}

/// Parse a NOTIFY body into its properties.
///
/// Unrecognised elements are skipped. A `LastChange` value that is not
/// itself parseable is kept verbatim under its own name.
pub fn parse_property_set(body: &str) -> Result<PropertySet, SoapError> {
    let root = Element::parse(body.as_bytes()).map_err(|e| SoapError::Parse(e.to_string()))?;
    if root.name != "propertyset" {
        return Err(SoapError::Parse(format!(
            "Expected propertyset root, found {}",
            root.name
        )));
    }

    let mut set = PropertySet::default();
    for property in child_elements(&root).filter(|e| e.name == "property") {
        for variable in child_elements(property) {
            let value = element_text(variable);
            if variable.name == LAST_CHANGE {
                match parse_last_change(&value) {
                    Ok(expanded) => {
                        for (name, value) in expanded {
                            set.push(name, value);
                        }
                        continue;
                    }
                    Err(e) => warn!(error = %e, "LastChange value is not valid XML, keeping raw"),
                }
            }
            set.push(variable.name.clone(), value);
        }
    }

    Ok(set)
}

/// Expand a `LastChange` document into its variables.
///
/// Each variable carries its value in the `val` attribute, falling back to
/// element text. Channelled variables are keyed with [`channel_key`].
pub fn parse_last_change(text: &str) -> Result<PropertySet, SoapError> {
    let event = Element::parse(text.as_bytes()).map_err(|e| SoapError::Parse(e.to_string()))?;

    // Sonos only ever sends a single instance
    let instance = child_elements(&event)
        .find(|e| e.name == "InstanceID" || e.name == "QueueID")
        .ok_or_else(|| SoapError::Parse("LastChange has no InstanceID or QueueID".to_string()))?;

    let mut set = PropertySet::default();
    for variable in child_elements(instance) {
        let value = variable
            .attributes
            .get("val")
            .cloned()
            .unwrap_or_else(|| element_text(variable));
        let name = match variable.attributes.get("channel") {
            Some(channel) => channel_key(&variable.name, channel),
            None => variable.name.clone(),
        };
        set.push(name, value);
    }

    Ok(set)
}

/// A parsed NOTIFY delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub sid: String,
    pub seq: u32,
    pub properties: PropertySet,
}

/// Parse a NOTIFY request from its `SID` and `SEQ` headers and body.
pub fn parse_notification(
    sid: &str,
    seq_header: &str,
    body: &str,
) -> Result<Notification, SoapError> {
    let sid = sid.trim();
    if sid.is_empty() {
        return Err(SoapError::MissingHeader("SID"));
    }
    Ok(Notification {
        sid: sid.to_string(),
        seq: parse_seq(seq_header)?,
        properties: parse_property_set(body)?,
    })
}

/// Parse a GENA `SEQ` header.
pub fn parse_seq(header: &str) -> Result<u32, SoapError> {
    header
        .trim()
        .parse::<u32>()
        .map_err(|_| SoapError::Parse(format!("Invalid SEQ header: {:?}", header)))
}
