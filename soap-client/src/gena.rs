//! GENA subscription requests (SUBSCRIBE / renew / UNSUBSCRIBE).

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::SoapError;
use crate::transport::{HttpMethod, HttpRequest, Transport, DEFAULT_REQUEST_TIMEOUT};

/// Subscription duration granted by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionTimeout {
    Seconds(u32),
    Infinite,
}

impl SubscriptionTimeout {
    /// Parse a `TIMEOUT` header such as `Second-1800` or `infinite`.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        if header.eq_ignore_ascii_case("infinite") || header.eq_ignore_ascii_case("Second-infinite")
        {
            return Some(SubscriptionTimeout::Infinite);
        }
        let seconds = header
            .get(..7)
            .filter(|prefix| prefix.eq_ignore_ascii_case("Second-"))
            .and_then(|_| header[7..].parse::<u32>().ok())?;
        Some(SubscriptionTimeout::Seconds(seconds))
    }

    /// Header value for a requested duration
    pub fn header_value(duration: Duration) -> String {
        format!("Second-{}", duration.as_secs())
    }

    /// `None` for an infinite subscription
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            SubscriptionTimeout::Seconds(secs) => Some(Duration::from_secs(u64::from(*secs))),
            SubscriptionTimeout::Infinite => None,
        }
    }
}

/// Response from a UPnP subscription request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionResponse {
    /// Subscription ID returned by the device
    pub sid: String,
    /// Timeout granted by the device
    pub timeout: SubscriptionTimeout,
}

/// Client for the GENA subscription verbs.
#[derive(Clone)]
pub struct GenaClient {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
}

impl GenaClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Open a new subscription.
    ///
    /// # Arguments
    /// * `event_url` - Absolute event subscription URL of the service
    /// * `callback_url` - URL where the device should deliver NOTIFY requests
    /// * `requested` - Requested subscription duration
    pub async fn subscribe(
        &self,
        event_url: &str,
        callback_url: &str,
        requested: Duration,
    ) -> Result<SubscriptionResponse, SoapError> {
        let request = HttpRequest::new(HttpMethod::Subscribe, event_url)
            .header("CALLBACK", format!("<{}>", callback_url))
            .header("NT", "upnp:event")
            .header("TIMEOUT", SubscriptionTimeout::header_value(requested))
            .timeout(self.request_timeout);

        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            return Err(SoapError::HttpStatus(response.status));
        }

        let sid = response
            .header("SID")
            .filter(|sid| !sid.is_empty())
            .ok_or(SoapError::MissingHeader("SID"))?
            .to_string();
        let timeout = granted_timeout(response.header("TIMEOUT"), requested);

        debug!(%event_url, %sid, ?timeout, "subscribed");
        Ok(SubscriptionResponse { sid, timeout })
    }

    /// Renew an existing subscription.
    ///
    /// A 412 answer means the device has forgotten `sid` and is reported as
    /// [`SoapError::SubscriptionUnknown`].
    pub async fn renew(
        &self,
        event_url: &str,
        sid: &str,
        requested: Duration,
    ) -> Result<SubscriptionResponse, SoapError> {
        let request = HttpRequest::new(HttpMethod::Subscribe, event_url)
            .header("SID", sid)
            .header("TIMEOUT", SubscriptionTimeout::header_value(requested))
            .timeout(self.request_timeout);

        let response = self.transport.execute(request).await?;
        match response.status {
            412 => return Err(SoapError::SubscriptionUnknown(sid.to_string())),
            status if !(200..300).contains(&status) => return Err(SoapError::HttpStatus(status)),
            _ => {}
        }

        let timeout = granted_timeout(response.header("TIMEOUT"), requested);
        debug!(%event_url, %sid, ?timeout, "renewed subscription");
        Ok(SubscriptionResponse {
            sid: sid.to_string(),
            timeout,
        })
    }

    /// Cancel a subscription.
    pub async fn unsubscribe(&self, event_url: &str, sid: &str) -> Result<(), SoapError> {
        let request = HttpRequest::new(HttpMethod::Unsubscribe, event_url)
            .header("SID", sid)
            .timeout(self.request_timeout);

        let response = self.transport.execute(request).await?;
        match response.status {
            412 => Err(SoapError::SubscriptionUnknown(sid.to_string())),
            status if !(200..300).contains(&status) => Err(SoapError::HttpStatus(status)),
            _ => {
                debug!(%event_url, %sid, "unsubscribed");
                Ok(())
            }
        }
    }
}

fn granted_timeout(header: Option<&str>, requested: Duration) -> SubscriptionTimeout {
    header
        .and_then(SubscriptionTimeout::parse)
        .unwrap_or_else(|| {
            SubscriptionTimeout::Seconds(u32::try_from(requested.as_secs()).unwrap_or(u32::MAX))
        })
}
