//! Error types for the SOAP client

use thiserror::Error;

/// Errors raised by a [`Transport`](crate::Transport) while moving bytes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The request did not complete within its timeout
    #[error("Request to {url} timed out")]
    Timeout { url: String },

    /// The device could not be reached
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    /// Any other I/O failure while sending or reading
    #[error("I/O error: {0}")]
    Io(String),

    /// The request could not be built (bad method, header, url)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Errors that can occur during SOAP and GENA communication
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SoapError {
    /// Network or HTTP communication error
    #[error("Network/HTTP error: {0}")]
    Transport(#[from] TransportError),

    /// Non-success HTTP status that did not carry a SOAP fault
    #[error("Unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// XML parsing error
    #[error("XML parsing error: {0}")]
    Parse(String),

    /// SOAP fault returned by the device
    #[error("SOAP fault: error code {code} ({description})")]
    Fault { code: u16, description: String },

    /// A required response header was absent
    #[error("Missing {0} header in response")]
    MissingHeader(&'static str),

    /// The device rejected a SID it no longer knows (HTTP 412)
    #[error("Subscription {0} is not known to the device")]
    SubscriptionUnknown(String),
}

impl SoapError {
    /// Whether repeating the same request could plausibly succeed.
    ///
    /// Faults are a definitive answer from the device and never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            SoapError::Transport(_) | SoapError::Parse(_) => true,
            SoapError::HttpStatus(status) => *status >= 500,
            SoapError::Fault { .. }
            | SoapError::MissingHeader(_)
            | SoapError::SubscriptionUnknown(_) => false,
        }
    }
}

/// Standard UPnP control error descriptions.
///
/// Codes above 700 are service specific and have no generic description.
pub fn upnp_error_description(code: u16) -> Option<&'static str> {
    let description = match code {
        400 => "Bad Request",
        401 => "Invalid Action",
        402 => "Invalid Args",
        404 => "Invalid Var",
        412 => "Precondition Failed",
        501 => "Action Failed",
        600 => "Argument Value Invalid",
        601 => "Argument Value Out of Range",
        602 => "Optional Action Not Implemented",
        603 => "Out Of Memory",
        604 => "Human Intervention Required",
        605 => "String Argument Too Long",
        606 => "Action Not Authorized",
        607 => "Signature Failure",
        608 => "Signature Missing",
        609 => "Not Encrypted",
        610 => "Invalid Sequence",
        611 => "Invalid Control URL",
        612 => "No Such Session",
        _ => return None,
    };
    Some(description)
}
