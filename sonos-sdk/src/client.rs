//! SonosClient - Main entry point for the SDK
//!
//! Owns the device registry and the event pipeline, and keeps both in step
//! with discovery: removing a device ends its subscriptions, and a device
//! that re-advertises at a new address is resubscribed there.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use soap_client::{ActionResult, HttpTransport, Transport};
use sonos_discovery::{DeviceDescriptor, DeviceEvent, DeviceUuid, DiscoveryListener, ServiceDescriptor};
use sonos_state::{
    spawn_state_event_worker, DeviceRegistry, PropertyChange, RegistryEvent, ZoneTopology,
    ZONE_GROUP_STATE,
};
use sonos_stream::{
    EventBroker, EventBrokerBuilder, ServiceRef, SubscriptionEvent, SubscriptionHandle,
    SubscriptionManager,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, RetryPolicy};
use crate::control::ControlClient;
use crate::error::{Result, SdkError};

/// Service publishing the household topology
pub const ZONE_GROUP_TOPOLOGY: &str = "urn:schemas-upnp-org:service:ZoneGroupTopology:1";

/// Main SDK entry point.
///
/// # Example
///
/// ```rust,ignore
/// use futures::StreamExt;
/// use sonos_sdk::SonosClient;
///
/// let client = SonosClient::builder().start().await?;
/// for device in client.discover(Duration::from_secs(2)).await {
///     client.subscribe(&device.uuid, "AVTransport")?;
/// }
///
/// let mut changes = client.property_changes();
/// while let Some(change) = changes.next().await {
///     println!("{} {} = {}", change.device, change.name, change.value);
/// }
/// ```
pub struct SonosClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    control: ControlClient,
    registry: Arc<DeviceRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    callback_url: String,
    broker: Mutex<Option<EventBroker>>,
    listener: Option<DiscoveryListener>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl SonosClient {
    pub fn builder() -> SonosClientBuilder {
        SonosClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Device registry backing this client
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Base URL devices deliver events to
    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Search the network. Results are not added to the registry.
    pub fn search(&self, timeout: Duration) -> BoxStream<'static, DeviceDescriptor> {
        sonos_discovery::search(self.transport.clone(), self.config.discovery.clone(), timeout)
    }

    /// Search the network and add every device found to the registry.
    pub async fn discover(&self, timeout: Duration) -> Vec<DeviceDescriptor> {
        let devices: Vec<DeviceDescriptor> = self.search(timeout).collect().await;
        for device in &devices {
            self.track_device(device.clone());
        }
        info!(count = devices.len(), "discovery finished");
        devices
    }

    /// Add the device whose description is at `location`, e.g.
    /// `http://192.168.1.20:1400/xml/device_description.xml`.
    pub async fn add_device(&self, location: &str) -> Result<DeviceDescriptor> {
        let device = sonos_discovery::describe(self.transport.as_ref(), location).await?;
        self.track_device(device.clone());
        Ok(device)
    }

    /// Forget a device. Its subscriptions are ended in the background.
    pub fn remove_device(&self, uuid: &DeviceUuid) -> Option<DeviceDescriptor> {
        self.registry.remove(uuid)
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.registry.devices()
    }

    pub fn device(&self, uuid: &DeviceUuid) -> Option<DeviceDescriptor> {
        self.registry.get(uuid)
    }

    fn track_device(&self, device: DeviceDescriptor) {
        if let Some(listener) = &self.listener {
            listener.observe(&device);
        }
        self.registry.upsert(device);
    }

    /// Look up a service by full URN or short name, e.g. `AVTransport`.
    fn resolve(&self, uuid: &DeviceUuid, service_type: &str) -> Result<ServiceDescriptor> {
        let device = self
            .registry
            .get(uuid)
            .ok_or_else(|| SdkError::DeviceNotFound(uuid.clone()))?;
        device
            .service(service_type)
            .cloned()
            .ok_or_else(|| SdkError::ServiceNotFound {
                device: uuid.clone(),
                service_type: service_type.to_string(),
            })
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Invoke a SOAP action with the default action timeout.
    pub async fn invoke(
        &self,
        uuid: &DeviceUuid,
        service_type: &str,
        action: &str,
        args: &[(&str, &str)],
    ) -> Result<ActionResult> {
        self.invoke_with_timeout(uuid, service_type, action, args, self.config.default_action_timeout)
            .await
    }

    /// Invoke a SOAP action.
    ///
    /// Transport failures and malformed responses are retried per the
    /// client's [`RetryPolicy`]; a SOAP fault is returned at once as
    /// [`SdkError::ActionFault`].
    pub async fn invoke_with_timeout(
        &self,
        uuid: &DeviceUuid,
        service_type: &str,
        action: &str,
        args: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<ActionResult> {
        let service = self.resolve(uuid, service_type)?;
        self.control.invoke(&service, action, args, timeout).await
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Keep a GENA subscription to a service alive until unsubscribed.
    pub fn subscribe(&self, uuid: &DeviceUuid, service_type: &str) -> Result<SubscriptionHandle> {
        let service = self.resolve(uuid, service_type)?;
        let handle = self.subscriptions.track(
            ServiceRef::new(uuid.clone(), service.service_type.as_str()),
            service.event_sub_url.as_str(),
        )?;
        Ok(handle)
    }

    pub async fn unsubscribe(&self, uuid: &DeviceUuid, service_type: &str) -> Result<()> {
        let service = self.resolve(uuid, service_type)?;
        self.subscriptions
            .untrack(&ServiceRef::new(uuid.clone(), service.service_type))
            .await?;
        Ok(())
    }

    /// Stream of stored property changes.
    ///
    /// Each call starts a new stream that sees changes from that point on.
    pub fn property_changes(&self) -> BoxStream<'static, PropertyChange> {
        stream::unfold(self.registry.property_changes(), |mut changes| async move {
            loop {
                match changes.recv().await {
                    Ok(change) => return Some((change, changes)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "property change stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    pub fn registry_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.registry_events()
    }

    pub fn subscription_events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.subscriptions.subscription_events()
    }

    /// Last evented value of a property, e.g. `Volume/Master`.
    pub fn property(&self, uuid: &DeviceUuid, service_type: &str, name: &str) -> Option<String> {
        let service = self.resolve(uuid, service_type).ok()?;
        self.registry
            .property(&ServiceRef::new(uuid.clone(), service.service_type), name)
    }

    // ========================================================================
    // Topology
    // ========================================================================

    pub fn topology(&self) -> ZoneTopology {
        self.registry.topology()
    }

    /// Fetch `ZoneGroupState` from the first device that answers.
    pub async fn refresh_topology(&self) -> Result<ZoneTopology> {
        let mut last_error = None;

        for device in self.registry.devices() {
            let Some(service) = device.service(ZONE_GROUP_TOPOLOGY) else {
                continue;
            };
            let result = self
                .control
                .invoke(service, "GetZoneGroupState", &[], self.config.default_action_timeout)
                .await;

            match result {
                Ok(result) => {
                    let xml = result.get(ZONE_GROUP_STATE).ok_or_else(|| {
                        SdkError::MalformedResponse(format!("{} missing from response", ZONE_GROUP_STATE))
                    })?;
                    self.registry.update_topology(xml)?;
                    return Ok(self.registry.topology());
                }
                Err(e) => {
                    warn!(uuid = %device.uuid, error = %e, "topology refresh failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SdkError::NoDevice {
            service_type: ZONE_GROUP_TOPOLOGY.to_string(),
        }))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Unsubscribe everything and stop background tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(listener) = &self.listener {
            listener.shutdown();
        }

        let broker = self.broker.lock().take();
        if let Some(broker) = broker {
            broker.shutdown().await;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("sonos client stopped");
    }
}

impl Drop for SonosClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builder for [`SonosClient`].
pub struct SonosClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    listener: Option<(DiscoveryListener, mpsc::UnboundedReceiver<DeviceEvent>)>,
}

impl Default for SonosClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SonosClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            transport: None,
            listener: None,
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `transport` for all outbound HTTP instead of a fresh [`HttpTransport`].
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn with_callback_config(mut self, callback: callback_server::CallbackConfig) -> Self {
        self.config.callback = callback;
        self
    }

    pub fn with_subscription_config(mut self, subscription: sonos_stream::SubscriptionConfig) -> Self {
        self.config.subscription = subscription;
        self
    }

    pub fn with_discovery_config(mut self, discovery: sonos_discovery::DiscoveryConfig) -> Self {
        self.config.discovery = discovery;
        self
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_action_timeout = timeout;
        self
    }

    /// Follow SSDP advertisements, adding and removing devices as they
    /// come and go.
    pub fn with_discovery_listener(mut self, enabled: bool) -> Self {
        self.config.run_discovery_listener = enabled;
        self
    }

    /// Follow an already running listener instead of starting one.
    pub fn with_listener(
        mut self,
        listener: DiscoveryListener,
        events: mpsc::UnboundedReceiver<DeviceEvent>,
    ) -> Self {
        self.listener = Some((listener, events));
        self
    }

    /// Start the callback server and background tasks.
    pub async fn start(self) -> Result<SonosClient> {
        let config = self.config;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()));

        let mut broker = EventBrokerBuilder::new()
            .with_transport(transport.clone())
            .with_callback_config(config.callback.clone())
            .with_subscription_config(config.subscription.clone())
            .build()
            .await?;
        let events = broker.event_stream().ok_or(SdkError::Shutdown)?;
        let subscriptions = broker.subscriptions().clone();
        let callback_url = broker.callback_url().to_string();

        let registry = Arc::new(DeviceRegistry::new());
        let cancel = CancellationToken::new();

        let mut tasks = vec![
            spawn_state_event_worker(registry.clone(), events),
            tokio::spawn(follow_registry(
                registry.registry_events(),
                registry.clone(),
                subscriptions.clone(),
                cancel.child_token(),
            )),
        ];

        let listener = match self.listener {
            Some(running) => Some(running),
            None if config.run_discovery_listener => Some(DiscoveryListener::start(
                transport.clone(),
                config.discovery.clone(),
            )?),
            None => None,
        };
        let listener = listener.map(|(listener, device_events)| {
            tasks.push(tokio::spawn(apply_discovery(
                device_events,
                registry.clone(),
                cancel.child_token(),
            )));
            listener
        });

        info!(%callback_url, listener = listener.is_some(), "sonos client started");
        Ok(SonosClient {
            control: ControlClient::new(transport.clone(), config.retry.clone()),
            config,
            transport,
            registry,
            subscriptions,
            callback_url,
            broker: Mutex::new(Some(broker)),
            listener,
            tasks: Mutex::new(tasks),
            cancel,
        })
    }
}

/// Keep subscriptions in step with registry membership.
async fn follow_registry(
    mut events: broadcast::Receiver<RegistryEvent>,
    registry: Arc<DeviceRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(RegistryEvent::DeviceRemoved(uuid)) => {
                let ended = subscriptions.untrack_device(&uuid).await;
                if ended > 0 {
                    info!(%uuid, ended, "ended subscriptions of removed device");
                }
            }
            Ok(RegistryEvent::DeviceUpdated(device)) => retrack(&subscriptions, &device).await,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "registry event bridge lagged, reconciling subscriptions");
                reconcile(&registry, &subscriptions).await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("registry bridge stopped");
}

/// Resubscribe the tracked services of `device` whose event URL changed.
async fn retrack(subscriptions: &SubscriptionManager, device: &DeviceDescriptor) {
    let services: Vec<ServiceRef> = subscriptions
        .tracked()
        .into_iter()
        .filter(|service| service.device == device.uuid)
        .collect();

    for service in services {
        let current = device
            .service(&service.service_type)
            .map(|descriptor| descriptor.event_sub_url.clone());
        if current.is_some() && current == subscriptions.event_url(&service) {
            continue;
        }

        if let Err(e) = subscriptions.untrack(&service).await {
            debug!(%service, error = %e, "already untracked");
            continue;
        }
        let Some(event_url) = current else {
            debug!(%service, "service no longer offered, not resubscribing");
            continue;
        };
        info!(%service, %event_url, "event URL changed, resubscribing");
        if let Err(e) = subscriptions.track(service.clone(), event_url) {
            warn!(%service, error = %e, "failed to resubscribe");
        }
    }
}

/// Bring tracked subscriptions back in line with the registry after
/// registry events were missed.
async fn reconcile(registry: &DeviceRegistry, subscriptions: &SubscriptionManager) {
    let mut devices: Vec<DeviceUuid> = subscriptions
        .tracked()
        .into_iter()
        .map(|service| service.device)
        .collect();
    devices.dedup();

    for uuid in devices {
        match registry.get(&uuid) {
            Some(device) => retrack(subscriptions, &device).await,
            None => {
                let ended = subscriptions.untrack_device(&uuid).await;
                info!(%uuid, ended, "ended subscriptions of vanished device");
            }
        }
    }
}

/// Apply listener events to the registry.
async fn apply_discovery(
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    registry: Arc<DeviceRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(DeviceEvent::Found(device)) => {
                registry.upsert(device);
            }
            Some(DeviceEvent::Lost(uuid)) => {
                registry.remove(&uuid);
            }
            None => break,
        }
    }
    debug!("discovery bridge stopped");
}
