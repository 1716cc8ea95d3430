//! Event routing for HTTP callback notifications.
//!
//! The `EventRouter` knows the SIDs of established subscriptions and
//! forwards their NOTIFY payloads to a channel. A device may deliver its
//! initial event before the SUBSCRIBE response carrying the SID has been
//! processed, so callback paths with a subscription in flight can hold a few
//! early payloads until the SID is registered.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

/// Early payloads held per callback path while its SUBSCRIBE is in flight.
pub const MAX_EARLY_EVENTS: usize = 8;

/// Raw UPnP event notification received on the callback server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
    /// The subscription ID from the UPnP SID header
    pub subscription_id: String,
    /// Event sequence number from the SEQ header
    pub seq: u32,
    /// Request path the device posted to
    pub path: String,
    /// The raw XML event body
    pub event_xml: String,
}

#[derive(Default)]
struct RouterState {
    /// SIDs whose events are forwarded
    subscriptions: HashSet<String>,
    /// Callback paths with a SUBSCRIBE in flight, and what arrived early
    pending: HashMap<String, Vec<NotificationPayload>>,
}

/// Routes events from HTTP callbacks to a channel.
#[derive(Clone)]
pub struct EventRouter {
    state: Arc<RwLock<RouterState>>,
    event_sender: mpsc::UnboundedSender<NotificationPayload>,
}

impl EventRouter {
    /// Create a new event router.
    ///
    /// # Example
    ///
    /// ```
    /// use tokio::sync::mpsc;
    /// use callback_server::router::{EventRouter, NotificationPayload};
    ///
    /// let (tx, mut rx) = mpsc::unbounded_channel::<NotificationPayload>();
    /// let router = EventRouter::new(tx);
    /// ```
    pub fn new(event_sender: mpsc::UnboundedSender<NotificationPayload>) -> Self {
        Self {
            state: Arc::new(RwLock::new(RouterState::default())),
            event_sender,
        }
    }

    /// Register a subscription ID so its events are forwarded.
    ///
    /// Payloads for the SID that were held while its SUBSCRIBE was in flight
    /// are forwarded first, in arrival order.
    ///
    /// # Example
    ///
    /// ```
    /// # use tokio::sync::mpsc;
    /// # use callback_server::router::{EventRouter, NotificationPayload};
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let (tx, _rx) = mpsc::unbounded_channel::<NotificationPayload>();
    /// # let router = EventRouter::new(tx);
    /// router.register("uuid:RINCON_AAA_sub0000000001".to_string()).await;
    /// assert!(router.is_registered("uuid:RINCON_AAA_sub0000000001").await);
    /// # }
    /// ```
    pub async fn register(&self, subscription_id: String) {
        let mut state = self.state.write().await;

        for held in state.pending.values_mut() {
            let (early, other): (Vec<_>, Vec<_>) = held
                .drain(..)
                .partition(|payload| payload.subscription_id == subscription_id);
            *held = other;
            for payload in early {
                debug!(sid = %subscription_id, seq = payload.seq, "releasing early event");
                let _ = self.event_sender.send(payload);
            }
        }

        state.subscriptions.insert(subscription_id);
    }

    /// Unregister a subscription ID.
    ///
    /// Events that arrive for it afterwards are rejected.
    pub async fn unregister(&self, subscription_id: &str) {
        self.state.write().await.subscriptions.remove(subscription_id);
    }

    /// Hold events for unknown SIDs arriving on `path` until [`settle`] is
    /// called for it.
    ///
    /// [`settle`]: EventRouter::settle
    pub async fn expect(&self, path: &str) {
        self.state
            .write()
            .await
            .pending
            .entry(path.to_string())
            .or_default();
    }

    /// Stop holding events for `path`, dropping whatever was not claimed by
    /// a registered SID.
    pub async fn settle(&self, path: &str) {
        if let Some(unclaimed) = self.state.write().await.pending.remove(path) {
            if !unclaimed.is_empty() {
                debug!(path, dropped = unclaimed.len(), "dropping unclaimed early events");
            }
        }
    }

    pub async fn is_registered(&self, subscription_id: &str) -> bool {
        self.state.read().await.subscriptions.contains(subscription_id)
    }

    pub async fn registered_count(&self) -> usize {
        self.state.read().await.subscriptions.len()
    }

    /// Route an incoming event to the channel.
    ///
    /// Returns `false`, dropping the payload, when the SID is not registered
    /// and no subscription is in flight on the payload's path.
    pub async fn route_event(&self, payload: NotificationPayload) -> bool {
        {
            let state = self.state.read().await;
            if state.subscriptions.contains(&payload.subscription_id) {
                trace!(sid = %payload.subscription_id, seq = payload.seq, "routing event");
                // Receiver gone means the SDK is shutting down
                let _ = self.event_sender.send(payload);
                return true;
            }
            if !state.pending.contains_key(&payload.path) {
                return false;
            }
        }

        let mut state = self.state.write().await;
        // Registered while the lock was released
        if state.subscriptions.contains(&payload.subscription_id) {
            let _ = self.event_sender.send(payload);
            return true;
        }
        match state.pending.get_mut(&payload.path) {
            Some(held) if held.len() < MAX_EARLY_EVENTS => {
                trace!(sid = %payload.subscription_id, seq = payload.seq, "holding early event");
                held.push(payload);
                true
            }
            _ => false,
        }
    }
}
