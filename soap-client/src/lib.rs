//! Private SOAP client for UPnP device communication
//!
//! This crate provides the protocol layer used to talk to Sonos speakers:
//! an HTTP [`Transport`] abstraction, SOAP envelope encoding and decoding,
//! GENA subscription requests and NOTIFY body parsing.

mod error;
pub mod envelope;
pub mod event;
pub mod gena;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod transport;

pub use envelope::ActionResult;
pub use error::{upnp_error_description, SoapError, TransportError};
pub use event::{Notification, PropertySet};
pub use gena::{GenaClient, SubscriptionResponse, SubscriptionTimeout};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, Transport};

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

/// A minimal SOAP client for UPnP device communication.
///
/// Performs a single attempt per call; retry policy is the caller's concern.
#[derive(Clone)]
pub struct SoapClient {
    transport: Arc<dyn Transport>,
}

impl SoapClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Invoke `action` on the service at `control_url`.
    ///
    /// # Arguments
    /// * `control_url` - Absolute control URL of the service
    /// * `service_type` - Full service type URN, used as the action namespace
    /// * `action` - Action name, e.g. `Play`
    /// * `args` - Ordered input arguments
    /// * `timeout` - Per-request timeout
    pub async fn call(
        &self,
        control_url: &str,
        service_type: &str,
        action: &str,
        args: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<ActionResult, SoapError> {
        let request = HttpRequest::new(HttpMethod::Post, control_url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPACTION", envelope::soap_action_header(service_type, action))
            .body(envelope::encode(service_type, action, args))
            .timeout(timeout);

        debug!(%control_url, %action, "invoking SOAP action");
        let response = self.transport.execute(request).await?;

        if response.is_success() {
            return envelope::decode(&response.body, action);
        }

        // Faults arrive as HTTP 500; anything else is a plain status error
        match envelope::decode(&response.body, action) {
            Err(fault @ SoapError::Fault { .. }) => Err(fault),
            _ => Err(SoapError::HttpStatus(response.status)),
        }
    }
}
