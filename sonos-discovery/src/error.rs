//! Error types for the discovery system.

use std::fmt;

/// Error type for discovery operations.
///
/// Discovery never aborts because of one bad device: these errors are logged
/// and the offending device skipped, except where a caller asked for one
/// device explicitly through [`describe`](crate::describe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Network-related errors (socket creation, multicast membership)
    NetworkError(String),
    /// Parsing errors (description XML, SSDP message)
    ParseError(String),
    /// The description document could not be fetched
    DeviceUnreachable { location: String, reason: String },
    /// Invalid device data or non-Sonos device detected
    InvalidDevice(String),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            DiscoveryError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            DiscoveryError::DeviceUnreachable { location, reason } => {
                write!(f, "Device at {} unreachable: {}", location, reason)
            }
            DiscoveryError::InvalidDevice(msg) => write!(f, "Invalid device: {}", msg),
        }
    }
}

impl std::error::Error for DiscoveryError {}

/// Convenience Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;
