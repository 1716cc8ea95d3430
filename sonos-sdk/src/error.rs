use soap_client::{SoapError, TransportError};
use sonos_discovery::{DeviceUuid, DiscoveryError};
use sonos_stream::{BrokerError, SubscriptionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SdkError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("UPnP error {code}: {description}")]
    ActionFault { code: u16, description: String },

    #[error("Unexpected HTTP status {0}")]
    HttpStatus(u16),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Device at {location} unreachable: {reason}")]
    DeviceUnreachable { location: String, reason: String },

    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceUuid),

    #[error("Device {device} has no {service_type} service")]
    ServiceNotFound {
        device: DeviceUuid,
        service_type: String,
    },

    #[error("No known device exposes {service_type}")]
    NoDevice { service_type: String },

    #[error("Callback server error: {0}")]
    Callback(#[from] BrokerError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Discovery error: {0}")]
    Discovery(DiscoveryError),

    #[error("State management error: {0}")]
    State(#[from] sonos_state::StateError),

    #[error("Client has been shut down")]
    Shutdown,
}

impl SdkError {
    /// Whether the failed action may succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SdkError::Transport(_) | SdkError::MalformedResponse(_) => true,
            SdkError::HttpStatus(status) => *status >= 500,
            _ => false,
        }
    }
}

impl From<SoapError> for SdkError {
    fn from(err: SoapError) -> Self {
        match err {
            SoapError::Transport(e) => SdkError::Transport(e),
            SoapError::Fault { code, description } => SdkError::ActionFault { code, description },
            SoapError::HttpStatus(status) => SdkError::HttpStatus(status),
            SoapError::Parse(msg) => SdkError::MalformedResponse(msg),
            other @ (SoapError::MissingHeader(_) | SoapError::SubscriptionUnknown(_)) => {
                SdkError::MalformedResponse(other.to_string())
            }
        }
    }
}

impl From<DiscoveryError> for SdkError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::DeviceUnreachable { location, reason } => {
                SdkError::DeviceUnreachable { location, reason }
            }
            other => SdkError::Discovery(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soap_errors_map_to_sdk_errors() {
        let fault: SdkError = SoapError::Fault {
            code: 501,
            description: "Action Failed".to_string(),
        }
        .into();
        assert!(matches!(fault, SdkError::ActionFault { code: 501, .. }));
        assert!(!fault.is_retryable());

        let timeout: SdkError = SoapError::Transport(TransportError::Timeout {
            url: "http://192.168.1.20:1400".to_string(),
        })
        .into();
        assert!(matches!(timeout, SdkError::Transport(TransportError::Timeout { .. })));
        assert!(timeout.is_retryable());

        let parse: SdkError = SoapError::Parse("unexpected EOF".to_string()).into();
        assert!(matches!(parse, SdkError::MalformedResponse(_)));
        assert!(parse.is_retryable());

        assert!(!SdkError::from(SoapError::HttpStatus(404)).is_retryable());
        assert!(SdkError::from(SoapError::HttpStatus(503)).is_retryable());
    }

    #[test]
    fn test_unreachable_description_keeps_location() {
        let err: SdkError = DiscoveryError::DeviceUnreachable {
            location: "http://192.168.1.20:1400/xml/device_description.xml".to_string(),
            reason: "connection refused".to_string(),
        }
        .into();
        assert!(matches!(err, SdkError::DeviceUnreachable { .. }));

        let err: SdkError = DiscoveryError::NetworkError("no multicast".to_string()).into();
        assert!(matches!(err, SdkError::Discovery(_)));
    }
}
