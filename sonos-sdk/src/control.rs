//! SOAP action invocation with retries

use std::sync::Arc;
use std::time::Duration;

use soap_client::{ActionResult, SoapClient, Transport};
use sonos_discovery::ServiceDescriptor;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{Result, SdkError};

/// Sends SOAP actions to a resolved service, retrying per [`RetryPolicy`].
#[derive(Clone)]
pub(crate) struct ControlClient {
    soap: SoapClient,
    retry: RetryPolicy,
}

impl ControlClient {
    pub(crate) fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            soap: SoapClient::new(transport),
            retry,
        }
    }

    /// Invoke `action` until it succeeds, fails definitively or the retry
    /// budget is spent. The last error is returned in the latter cases.
    pub(crate) async fn invoke(
        &self,
        service: &ServiceDescriptor,
        action: &str,
        args: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<ActionResult> {
        let attempts = self.retry.attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self
                .soap
                .call(&service.control_url, &service.service_type, action, args, timeout)
                .await
                .map_err(SdkError::from);

            match result {
                Ok(result) => {
                    debug!(service = service.short_name(), action, attempt, "action succeeded");
                    return Ok(result);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.retry.backoff(attempt - 1);
                    warn!(
                        service = service.short_name(),
                        action,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "action failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(service = service.short_name(), action, attempt, error = %e, "action failed");
                    return Err(e);
                }
            }
        }
    }
}
