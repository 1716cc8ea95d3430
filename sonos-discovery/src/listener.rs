//! Passive discovery from SSDP advertisements.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use soap_client::Transport;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::describe;
use crate::error::Result;
use crate::ssdp::{self, SsdpKind, SsdpMessage};
use crate::{DeviceDescriptor, DeviceEvent, DeviceUuid, DiscoveryConfig};

#[derive(Debug, Clone)]
struct Lease {
    location: String,
    expires_at: Instant,
}

type Leases = Arc<Mutex<HashMap<DeviceUuid, Lease>>>;

/// Background listener turning SSDP advertisements into [`DeviceEvent`]s.
///
/// A device is reported `Found` when it first advertises or its location
/// changes, and `Lost` on `ssdp:byebye` or once its advertised lease runs
/// out without a refresh.
pub struct DiscoveryListener {
    leases: Leases,
    default_max_age: Duration,
    cancel: CancellationToken,
}

impl DiscoveryListener {
    /// Join the SSDP multicast group and start listening.
    pub fn start(
        transport: Arc<dyn Transport>,
        config: DiscoveryConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeviceEvent>)> {
        let socket = ssdp::open_multicast_socket()?;
        info!("listening for SSDP advertisements");
        Ok(Self::from_messages(ssdp::datagrams(socket, None), transport, config))
    }

    /// Run the listener over any source of SSDP messages, such as a socket
    /// shared with other code.
    pub fn from_messages<S>(
        messages: S,
        transport: Arc<dyn Transport>,
        config: DiscoveryConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DeviceEvent>)
    where
        S: Stream<Item = SsdpMessage> + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let listener = Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            default_max_age: config.default_max_age,
            cancel: CancellationToken::new(),
        };

        let worker = Worker {
            leases: listener.leases.clone(),
            transport,
            events: events_tx,
            default_max_age: config.default_max_age,
            cancel: listener.cancel.clone(),
        };
        tokio::spawn(worker.run(messages, config.sweep_interval));

        (listener, events_rx)
    }

    /// Start a lease for a device found by active search, so a later
    /// advertisement at the same location only refreshes it.
    pub fn observe(&self, device: &DeviceDescriptor) {
        self.leases.lock().insert(
            device.uuid.clone(),
            Lease {
                location: device.location.clone(),
                expires_at: Instant::now() + self.default_max_age,
            },
        );
    }

    /// Devices with a live lease
    pub fn known_devices(&self) -> Vec<DeviceUuid> {
        self.leases.lock().keys().cloned().collect()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    leases: Leases,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    default_max_age: Duration,
    cancel: CancellationToken,
}

impl Worker {
    async fn run<S>(self, messages: S, sweep_interval: Duration)
    where
        S: Stream<Item = SsdpMessage> + Send + 'static,
    {
        let mut messages = Box::pin(messages);
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sweep.tick() => self.expire(Instant::now()),
                message = messages.next() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
            }
        }
        debug!("discovery listener stopped");
    }

    fn handle(&self, message: SsdpMessage) {
        if !message.is_likely_sonos() {
            return;
        }
        let uuid = message.uuid();

        match message.kind {
            SsdpKind::ByeBye => {
                if self.leases.lock().remove(&uuid).is_some() {
                    info!(%uuid, "device said goodbye");
                    let _ = self.events.send(DeviceEvent::Lost(uuid));
                }
            }
            SsdpKind::Alive | SsdpKind::Response => {
                let Some(location) = message.location else {
                    return;
                };
                let expires_at =
                    Instant::now() + message.max_age.unwrap_or(self.default_max_age);

                let needs_fetch = {
                    let mut leases = self.leases.lock();
                    match leases.get_mut(&uuid) {
                        Some(lease) if lease.location == location => {
                            lease.expires_at = expires_at;
                            false
                        }
                        _ => {
                            leases.insert(
                                uuid.clone(),
                                Lease {
                                    location: location.clone(),
                                    expires_at,
                                },
                            );
                            true
                        }
                    }
                };

                if needs_fetch {
                    self.fetch(uuid, location);
                }
            }
        }
    }

    /// Fetch the description off the listener loop; the lease is re-checked
    /// afterwards since a byebye or a newer location may have arrived.
    fn fetch(&self, uuid: DeviceUuid, location: String) {
        let leases = self.leases.clone();
        let transport = self.transport.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = describe(transport.as_ref(), &location) => result,
            };

            let still_current = leases
                .lock()
                .get(&uuid)
                .map(|lease| lease.location == location)
                .unwrap_or(false);

            match result {
                Ok(device) if still_current => {
                    info!(%uuid, %location, "device found");
                    let _ = events.send(DeviceEvent::Found(device));
                }
                Ok(_) => debug!(%uuid, "lease changed while fetching description"),
                Err(e) => {
                    warn!(error = %e, %uuid, "skipping advertised device");
                    // Forget it so the next advertisement retries
                    if still_current {
                        leases.lock().remove(&uuid);
                    }
                }
            }
        });
    }

    fn expire(&self, now: Instant) {
        let expired: Vec<DeviceUuid> = {
            let mut leases = self.leases.lock();
            let expired: Vec<DeviceUuid> = leases
                .iter()
                .filter(|(_, lease)| lease.expires_at <= now)
                .map(|(uuid, _)| uuid.clone())
                .collect();
            for uuid in &expired {
                leases.remove(uuid);
            }
            expired
        };

        for uuid in expired {
            info!(%uuid, "device lease expired");
            let _ = self.events.send(DeviceEvent::Lost(uuid));
        }
    }
}
