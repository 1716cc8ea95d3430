//! Event broker wiring the callback server, subscription manager and event
//! processor together.
//!
//! # Example
//!
//! ```rust,ignore
//! use sonos_stream::{EventBrokerBuilder, ServiceRef};
//!
//! let mut broker = EventBrokerBuilder::new()
//!     .with_port_range(3400, 3500)
//!     .build()
//!     .await?;
//! let mut events = broker.event_stream().unwrap();
//!
//! broker
//!     .subscriptions()
//!     .track(ServiceRef::new("RINCON_AAA", AVT), event_url)?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{} changed {} properties", event.service, event.properties.len());
//! }
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use callback_server::{CallbackConfig, CallbackServer};
use soap_client::{GenaClient, HttpTransport, Transport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::BrokerError;
use crate::event::ServiceEvent;
use crate::manager::SubscriptionManager;
use crate::processor::{EventProcessor, EventProcessorStats};
use crate::types::SubscriptionConfig;

/// Running event pipeline.
///
/// NOTIFY requests arrive at the callback server, are resolved to their
/// service by the processor and come out of [`EventBroker::event_stream`] in
/// arrival order.
pub struct EventBroker {
    server: CallbackServer,
    subscriptions: Arc<SubscriptionManager>,
    processor: EventProcessor,
    processor_task: JoinHandle<()>,
    events: Option<mpsc::Receiver<ServiceEvent>>,
}

impl EventBroker {
    /// Subscription manager feeding this broker
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Take the stream of parsed service events. Only the first call
    /// returns `Some`.
    pub fn event_stream(&mut self) -> Option<mpsc::Receiver<ServiceEvent>> {
        self.events.take()
    }

    /// Base URL devices deliver NOTIFY requests to
    pub fn callback_url(&self) -> &str {
        self.server.base_url()
    }

    pub fn processor_stats(&self) -> EventProcessorStats {
        self.processor.stats()
    }

    /// Unsubscribe everything and stop the callback server.
    pub async fn shutdown(self) {
        self.subscriptions.shutdown().await;
        self.processor_task.abort();
        self.server.shutdown().await;
        info!("event broker stopped");
    }
}

/// Builder for creating and configuring an [`EventBroker`].
pub struct EventBrokerBuilder {
    transport: Option<Arc<dyn Transport>>,
    callback: CallbackConfig,
    config: SubscriptionConfig,
}

impl Default for EventBrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBrokerBuilder {
    /// Create a new builder with default configuration.
    ///
    /// Default configuration:
    /// - Port range: 3400-3500
    /// - Requested subscription timeout: 30 minutes
    /// - Renewal at 2/3 of the granted timeout
    /// - Renewal attempts: 3
    /// - Retry backoff base: 2 seconds
    /// - Event buffer size: 100
    pub fn new() -> Self {
        Self {
            transport: None,
            callback: CallbackConfig::default(),
            config: SubscriptionConfig::default(),
        }
    }

    /// Use `transport` for GENA requests instead of a fresh [`HttpTransport`].
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the callback server port range.
    ///
    /// The callback server will attempt to bind to a port within this range.
    /// If all ports are in use, the build will fail.
    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.callback.port_range = (start, end);
        self
    }

    /// Address devices should call back on.
    pub fn with_advertise_ip(mut self, ip: IpAddr) -> Self {
        self.callback.advertise_ip = Some(ip);
        self
    }

    pub fn with_callback_config(mut self, callback: CallbackConfig) -> Self {
        self.callback = callback;
        self
    }

    pub fn with_subscription_config(mut self, config: SubscriptionConfig) -> Self {
        self.config = config;
        self
    }

    /// Duration requested from devices in SUBSCRIBE requests.
    pub fn with_subscription_timeout(mut self, timeout: Duration) -> Self {
        self.config.requested_timeout = timeout;
        self
    }

    /// Start the callback server and the event processor.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Configuration`] for invalid settings and
    /// [`BrokerError::CallbackServer`] when no port can be bound.
    pub async fn build(self) -> Result<EventBroker, BrokerError> {
        self.validate()?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let server = CallbackServer::new(self.callback, notify_tx).await?;

        let subscriptions = Arc::new(SubscriptionManager::new(
            GenaClient::new(transport),
            server.router().clone(),
            server.base_url(),
            self.config.clone(),
        ));

        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer_size.max(1));
        let processor = EventProcessor::new(subscriptions.sid_table(), events_tx);
        let processor_task = tokio::spawn(processor.clone().run(notify_rx));

        debug!(callback_url = %server.base_url(), "event broker started");
        Ok(EventBroker {
            server,
            subscriptions,
            processor,
            processor_task,
            events: Some(events_rx),
        })
    }

    fn validate(&self) -> Result<(), BrokerError> {
        let (start, end) = self.callback.port_range;
        if start > end {
            return Err(BrokerError::Configuration(format!(
                "Invalid port range: {}-{}",
                start, end
            )));
        }
        if self.config.requested_timeout.is_zero() {
            return Err(BrokerError::Configuration(
                "Subscription timeout must be positive".to_string(),
            ));
        }
        let fraction = self.config.renewal_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(BrokerError::Configuration(format!(
                "Renewal fraction must be in (0, 1], got {}",
                fraction
            )));
        }
        Ok(())
    }
}
