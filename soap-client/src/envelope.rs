//! SOAP 1.1 envelope encoding and response decoding.

use quick_xml::escape::escape;
use xmltree::{Element, XMLNode};

use crate::error::{upnp_error_description, SoapError};

/// The decoded arguments of an action response, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionResult {
    values: Vec<(String, String)>,
}

impl ActionResult {
    pub fn new(values: Vec<(String, String)>) -> Self {
        Self { values }
    }

    /// Value of the named output argument
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_inner(self) -> Vec<(String, String)> {
        self.values
    }
}

/// Build the `SOAPACTION` header value, quotes included.
pub fn soap_action_header(service_type: &str, action: &str) -> String {
    format!("\"{}#{}\"", service_type, action)
}

/// Encode an action invocation as a SOAP envelope.
///
/// Argument values are XML-escaped; argument order is preserved since some
/// devices reject out-of-order arguments.
pub fn encode(service_type: &str, action: &str, args: &[(&str, &str)]) -> String {
    let payload: String = args
        .iter()
        .map(|(name, value)| format!("<{name}>{}</{name}>", escape(*value)))
        .collect();

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">"#,
            r#"<s:Body><u:{action} xmlns:u="{service_type}">{payload}</u:{action}></s:Body>"#,
            r#"</s:Envelope>"#
        ),
        action = action,
        service_type = service_type,
        payload = payload
    )
}

/// Decode a SOAP response body for `action`.
///
/// A `Fault` in the body wins over anything else and is returned as
/// [`SoapError::Fault`]. Elements other than the expected response are ignored.
pub fn decode(body: &str, action: &str) -> Result<ActionResult, SoapError> {
    let xml = Element::parse(body.as_bytes()).map_err(|e| SoapError::Parse(e.to_string()))?;
    extract_response(&xml, action)
}

fn extract_response(xml: &Element, action: &str) -> Result<ActionResult, SoapError> {
    let body = xml
        .get_child("Body")
        .ok_or_else(|| SoapError::Parse("Missing SOAP Body".to_string()))?;

    if let Some(fault) = body.get_child("Fault") {
        return Err(parse_fault(fault));
    }

    let response_name = format!("{}Response", action);
    let response = body
        .get_child(response_name.as_str())
        .ok_or_else(|| SoapError::Parse(format!("Missing {} element", response_name)))?;

    let values = child_elements(response)
        .map(|arg| (arg.name.clone(), element_text(arg)))
        .collect();

    Ok(ActionResult::new(values))
}

fn parse_fault(fault: &Element) -> SoapError {
    // Devices disagree on the casing of UPnPError
    let upnp_error = fault.get_child("detail").and_then(|detail| {
        child_elements(detail).find(|e| e.name.eq_ignore_ascii_case("UPnPError"))
    });

    let code = upnp_error
        .and_then(|e| e.get_child("errorCode"))
        .and_then(|c| c.get_text())
        .and_then(|t| t.trim().parse::<u16>().ok())
        .unwrap_or(500);

    let description = upnp_error
        .and_then(|e| e.get_child("errorDescription"))
        .map(element_text)
        .filter(|d| !d.is_empty())
        .or_else(|| upnp_error_description(code).map(str::to_string))
        .or_else(|| fault.get_child("faultstring").map(element_text))
        .unwrap_or_else(|| "Unknown error".to_string());

    SoapError::Fault { code, description }
}

pub(crate) fn child_elements(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(e) => Some(e),
        _ => None,
    })
}

pub(crate) fn element_text(element: &Element) -> String {
    element
        .get_text()
        .map(|text| text.into_owned())
        .unwrap_or_default()
}
