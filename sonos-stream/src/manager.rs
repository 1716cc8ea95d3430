//! Subscription lifecycle management.
//!
//! Every tracked service gets its own task that subscribes, renews at a
//! fraction of the granted timeout and resubscribes when the device drops
//! the subscription. Untracking cancels the task, which unregisters the SID
//! and sends a best-effort UNSUBSCRIBE on its way out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use callback_server::EventRouter;
use dashmap::DashMap;
use parking_lot::Mutex;
use soap_client::{GenaClient, SoapError, SubscriptionTimeout};
use sonos_discovery::DeviceUuid;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SubscriptionError};
use crate::event::SubscriptionEvent;
use crate::types::{ServiceRef, SubscriptionConfig, SubscriptionState};

/// Live SID to service mapping shared with the event processor.
///
/// Only SIDs of currently established subscriptions are present; a SID is
/// removed as soon as its subscription is lost or ended.
#[derive(Debug, Clone, Default)]
pub struct SidTable {
    sids: Arc<DashMap<String, ServiceRef>>,
}

impl SidTable {
    pub fn resolve(&self, sid: &str) -> Option<ServiceRef> {
        self.sids.get(sid).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sids.is_empty()
    }

    pub(crate) fn insert(&self, sid: String, service: ServiceRef) {
        self.sids.insert(sid, service);
    }

    pub(crate) fn remove(&self, sid: &str) {
        self.sids.remove(sid);
    }
}

/// Observer for one tracked subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    service: ServiceRef,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionHandle {
    pub fn service(&self) -> &ServiceRef {
        &self.service
    }

    /// Current state snapshot
    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    pub fn sid(&self) -> Option<String> {
        self.state.borrow().sid().map(str::to_string)
    }

    /// Wait until the subscription is active and return its SID.
    ///
    /// Fails with [`SubscriptionError::NotTracked`] if the service is
    /// untracked before that happens.
    pub async fn wait_active(&mut self) -> Result<String> {
        let state = self
            .state
            .wait_for(|state| {
                matches!(
                    state,
                    SubscriptionState::Active { .. } | SubscriptionState::Unsubscribed
                )
            })
            .await
            .map_err(|_| SubscriptionError::NotTracked(self.service.clone()))?;

        match &*state {
            SubscriptionState::Active { sid } => Ok(sid.clone()),
            _ => Err(SubscriptionError::NotTracked(self.service.clone())),
        }
    }

    /// Wait for the next state transition.
    pub async fn changed(&mut self) -> Result<SubscriptionState> {
        self.state
            .changed()
            .await
            .map_err(|_| SubscriptionError::NotTracked(self.service.clone()))?;
        Ok(self.state())
    }
}

struct Tracked {
    event_url: String,
    state: Arc<watch::Sender<SubscriptionState>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Keeps GENA subscriptions alive for every tracked service.
pub struct SubscriptionManager {
    gena: GenaClient,
    router: Arc<EventRouter>,
    callback_base: String,
    config: SubscriptionConfig,
    subscriptions: Mutex<HashMap<ServiceRef, Tracked>>,
    sids: SidTable,
    events: broadcast::Sender<SubscriptionEvent>,
    shutdown: CancellationToken,
}

impl SubscriptionManager {
    /// Create a manager.
    ///
    /// # Arguments
    /// * `gena` - Client used for SUBSCRIBE, renewal and UNSUBSCRIBE
    /// * `router` - Router of the callback server receiving the NOTIFYs
    /// * `callback_base` - Base URL of that callback server
    /// * `config` - Subscription timing configuration
    pub fn new(
        gena: GenaClient,
        router: Arc<EventRouter>,
        callback_base: impl Into<String>,
        config: SubscriptionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer_size.max(1));
        Self {
            gena,
            router,
            callback_base: callback_base.into().trim_end_matches('/').to_string(),
            config,
            subscriptions: Mutex::new(HashMap::new()),
            sids: SidTable::default(),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start maintaining a subscription for `service`.
    ///
    /// Tracking an already tracked service returns a handle to the existing
    /// subscription.
    pub fn track(
        &self,
        service: ServiceRef,
        event_url: impl Into<String>,
    ) -> Result<SubscriptionHandle> {
        if self.shutdown.is_cancelled() {
            return Err(SubscriptionError::Shutdown);
        }

        let mut subscriptions = self.subscriptions.lock();
        if let Some(tracked) = subscriptions.get(&service) {
            return Ok(SubscriptionHandle {
                service,
                state: tracked.state.subscribe(),
            });
        }

        let (state_tx, state_rx) = watch::channel(SubscriptionState::Subscribing);
        let state = Arc::new(state_tx);
        let cancel = self.shutdown.child_token();

        let worker = Worker {
            service: service.clone(),
            event_url: event_url.into(),
            callback_url: self.callback_url(&service),
            callback_path: format!("/{}/{}", service.device, service.short_name()),
            gena: self.gena.clone(),
            router: self.router.clone(),
            config: self.config.clone(),
            sids: self.sids.clone(),
            events: self.events.clone(),
            state: state.clone(),
            cancel: cancel.clone(),
        };
        debug!(%service, event_url = %worker.event_url, "tracking subscription");
        let worker_event_url = worker.event_url.clone();
        let task = tokio::spawn(worker.run());

        subscriptions.insert(
            service.clone(),
            Tracked {
                event_url: worker_event_url,
                state,
                cancel,
                task,
            },
        );

        Ok(SubscriptionHandle {
            service,
            state: state_rx,
        })
    }

    /// Stop maintaining the subscription for `service`.
    ///
    /// Returns once the subscription task has unregistered the SID and
    /// attempted an UNSUBSCRIBE.
    pub async fn untrack(&self, service: &ServiceRef) -> Result<()> {
        let tracked = self
            .subscriptions
            .lock()
            .remove(service)
            .ok_or_else(|| SubscriptionError::NotTracked(service.clone()))?;

        Self::stop(tracked).await;
        Ok(())
    }

    /// Untrack every service of `device`, returning how many were tracked.
    pub async fn untrack_device(&self, device: &DeviceUuid) -> usize {
        let removed: Vec<Tracked> = {
            let mut subscriptions = self.subscriptions.lock();
            let keys: Vec<ServiceRef> = subscriptions
                .keys()
                .filter(|service| &service.device == device)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| subscriptions.remove(key))
                .collect()
        };

        let count = removed.len();
        for tracked in removed {
            Self::stop(tracked).await;
        }
        if count > 0 {
            info!(%device, count, "untracked device subscriptions");
        }
        count
    }

    /// Untrack everything and refuse further tracking.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let all: Vec<Tracked> = self.subscriptions.lock().drain().map(|(_, t)| t).collect();
        for tracked in all {
            Self::stop(tracked).await;
        }
        debug!("subscription manager stopped");
    }

    pub fn state(&self, service: &ServiceRef) -> SubscriptionState {
        self.subscriptions
            .lock()
            .get(service)
            .map(|tracked| tracked.state.borrow().clone())
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    /// Event URL a tracked service is subscribed at.
    pub fn event_url(&self, service: &ServiceRef) -> Option<String> {
        self.subscriptions
            .lock()
            .get(service)
            .map(|tracked| tracked.event_url.clone())
    }

    pub fn tracked(&self) -> Vec<ServiceRef> {
        let mut services: Vec<ServiceRef> = self.subscriptions.lock().keys().cloned().collect();
        services.sort();
        services
    }

    /// Receive subscription lifecycle events.
    pub fn subscription_events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.events.subscribe()
    }

    /// SID lookup for routing NOTIFY deliveries.
    pub fn sid_table(&self) -> SidTable {
        self.sids.clone()
    }

    fn callback_url(&self, service: &ServiceRef) -> String {
        format!("{}/{}/{}", self.callback_base, service.device, service.short_name())
    }

    async fn stop(tracked: Tracked) {
        tracked.cancel.cancel();
        if let Err(e) = tracked.task.await {
            warn!(error = %e, "subscription task ended abnormally");
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum Outcome {
    Cancelled,
    Lost(String),
}

enum Renewal {
    Renewed(SubscriptionTimeout),
    Lost(String),
    Cancelled,
}

/// Task state for one tracked subscription.
struct Worker {
    service: ServiceRef,
    event_url: String,
    callback_url: String,
    /// Path part of `callback_url`, as seen by the callback server
    callback_path: String,
    gena: GenaClient,
    router: Arc<EventRouter>,
    config: SubscriptionConfig,
    sids: SidTable,
    events: broadcast::Sender<SubscriptionEvent>,
    state: Arc<watch::Sender<SubscriptionState>>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let mut failures = 0u32;

        loop {
            self.set_state(SubscriptionState::Subscribing);
            // The initial event may beat the SUBSCRIBE response
            self.router.expect(&self.callback_path).await;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = self.gena.subscribe(
                    &self.event_url,
                    &self.callback_url,
                    self.config.requested_timeout,
                ) => Some(result),
            };
            if let Some(Ok(granted)) = &result {
                self.activate(&granted.sid).await;
            }
            self.router.settle(&self.callback_path).await;
            let Some(result) = result else {
                break;
            };

            let granted = match result {
                Ok(granted) => granted,
                Err(e) => {
                    let delay = self
                        .config
                        .backoff(failures, self.config.resubscribe_backoff_max);
                    failures = failures.saturating_add(1);
                    warn!(
                        service = %self.service,
                        error = %e,
                        retry_in = ?delay,
                        "subscribe failed"
                    );
                    self.set_state(SubscriptionState::Failed {
                        reason: e.to_string(),
                    });
                    if !self.sleep(delay).await {
                        break;
                    }
                    continue;
                }
            };
            failures = 0;

            let sid = granted.sid;

            match self.maintain(&sid, granted.timeout).await {
                Outcome::Cancelled => {
                    self.teardown(Some(&sid)).await;
                    return;
                }
                Outcome::Lost(reason) => {
                    self.retire(&sid).await;
                    warn!(service = %self.service, %sid, %reason, "subscription lost");
                    self.set_state(SubscriptionState::Failed {
                        reason: reason.clone(),
                    });
                    self.emit(SubscriptionEvent::Lost {
                        service: self.service.clone(),
                        subscription_id: sid,
                        reason,
                    });
                }
            }
        }

        self.teardown(None).await;
    }

    /// Renew until cancelled or the subscription is lost.
    async fn maintain(&self, sid: &str, mut timeout: SubscriptionTimeout) -> Outcome {
        loop {
            let Some(granted) = timeout.as_duration() else {
                // Infinite subscriptions are never renewed
                self.cancel.cancelled().await;
                return Outcome::Cancelled;
            };

            if !self.sleep(self.config.renewal_delay(granted)).await {
                return Outcome::Cancelled;
            }

            self.set_state(SubscriptionState::Renewing {
                sid: sid.to_string(),
            });
            match self.renew(sid).await {
                Renewal::Renewed(renewed) => {
                    timeout = renewed;
                    self.set_state(SubscriptionState::Active {
                        sid: sid.to_string(),
                    });
                    debug!(service = %self.service, %sid, ?timeout, "subscription renewed");
                    self.emit(SubscriptionEvent::Renewed {
                        service: self.service.clone(),
                        subscription_id: sid.to_string(),
                    });
                }
                Renewal::Lost(reason) => return Outcome::Lost(reason),
                Renewal::Cancelled => return Outcome::Cancelled,
            }
        }
    }

    async fn renew(&self, sid: &str) -> Renewal {
        let attempts = self.config.renewal_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Renewal::Cancelled,
                result = self.gena.renew(&self.event_url, sid, self.config.requested_timeout) => result,
            };

            match result {
                Ok(granted) => return Renewal::Renewed(granted.timeout),
                Err(SoapError::SubscriptionUnknown(_)) => {
                    return Renewal::Lost("device no longer knows the subscription".to_string());
                }
                Err(e) => {
                    warn!(
                        service = %self.service,
                        %sid,
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "renewal failed"
                    );
                    last_error = e.to_string();
                    if attempt + 1 < attempts {
                        let delay = self
                            .config
                            .backoff(attempt, self.config.resubscribe_backoff_max);
                        if !self.sleep(delay).await {
                            return Renewal::Cancelled;
                        }
                    }
                }
            }
        }

        Renewal::Lost(format!(
            "renewal failed after {} attempts: {}",
            attempts, last_error
        ))
    }

    async fn activate(&self, sid: &str) {
        // The SID must resolve before the router releases anything for it
        self.sids.insert(sid.to_string(), self.service.clone());
        self.router.register(sid.to_string()).await;
        self.set_state(SubscriptionState::Active {
            sid: sid.to_string(),
        });
        info!(service = %self.service, %sid, "subscription established");
        self.emit(SubscriptionEvent::Established {
            service: self.service.clone(),
            subscription_id: sid.to_string(),
        });
    }

    /// Stop routing events for `sid`.
    async fn retire(&self, sid: &str) {
        self.sids.remove(sid);
        self.router.unregister(sid).await;
    }

    async fn teardown(&self, sid: Option<&str>) {
        if let Some(sid) = sid {
            self.retire(sid).await;
            if let Err(e) = self.gena.unsubscribe(&self.event_url, sid).await {
                debug!(service = %self.service, %sid, error = %e, "unsubscribe failed, ignoring");
            }
        }
        self.set_state(SubscriptionState::Unsubscribed);
        debug!(service = %self.service, "subscription ended");
        self.emit(SubscriptionEvent::Ended {
            service: self.service.clone(),
        });
    }

    /// Sleep unless cancelled first; `false` means cancelled.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn set_state(&self, state: SubscriptionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: SubscriptionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}
