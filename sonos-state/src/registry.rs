//! Device registry and per-service property state.
//!
//! The registry is the single owner of everything known about discovered
//! devices: their descriptors, the last evented value of every property and
//! the zone topology derived from `ZoneGroupState`. Mutations are short
//! synchronous critical sections; change notifications go out on broadcast
//! channels once the lock is released.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use sonos_discovery::{DeviceDescriptor, DeviceUuid};
use sonos_stream::{EventSequence, ServiceEvent, ServiceRef};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::topology::{parse_zone_group_state, ZoneTopology};

/// Evented variable carrying the household topology
pub const ZONE_GROUP_STATE: &str = "ZoneGroupState";

const CHANNEL_CAPACITY: usize = 256;

/// A stored property value changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub device: DeviceUuid,
    pub service_type: String,
    pub name: String,
    pub value: String,
}

/// Registry membership and topology changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    DeviceAdded(DeviceDescriptor),
    DeviceUpdated(DeviceDescriptor),
    DeviceRemoved(DeviceUuid),
    TopologyChanged,
}

/// Result of [`DeviceRegistry::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Updated,
    Unchanged,
}

/// Result of [`DeviceRegistry::apply_property_update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The stored value changed and a [`PropertyChange`] was emitted
    Changed,
    /// Newer delivery carrying the value already stored
    Unchanged,
    /// Older than, or a duplicate of, what is stored; ignored
    Stale,
    /// The device or service is not in the registry; ignored
    UnknownService,
}

/// Superseded SIDs remembered per service. Only recent ones can still have
/// deliveries in flight.
const RETIRED_SID_LIMIT: usize = 4;

#[derive(Debug, Clone)]
struct StoredProperty {
    value: String,
    sequence: EventSequence,
}

#[derive(Debug, Default)]
struct ServiceState {
    /// SID whose deliveries are currently authoritative
    current_sid: Option<String>,
    /// Most recently superseded SIDs; their deliveries are always stale
    retired: VecDeque<String>,
    properties: HashMap<String, StoredProperty>,
}

impl ServiceState {
    /// Whether a delivery at `sequence` may overwrite `name`.
    fn accepts(&mut self, name: &str, sequence: &EventSequence) -> bool {
        let sid = &sequence.subscription_id;
        if self.retired.iter().any(|retired| retired == sid) {
            return false;
        }

        match &self.current_sid {
            Some(current) if current == sid => {}
            Some(_) => {
                // A new SID supersedes the old one and restarts numbering
                if let Some(old) = self.current_sid.replace(sid.clone()) {
                    debug!(old_sid = %old, new_sid = %sid, "subscription superseded");
                    if self.retired.len() == RETIRED_SID_LIMIT {
                        self.retired.pop_front();
                    }
                    self.retired.push_back(old);
                }
            }
            None => self.current_sid = Some(sid.clone()),
        }

        match self.properties.get(name) {
            Some(stored) if &stored.sequence.subscription_id == sid => {
                sequence.seq > stored.sequence.seq
            }
            _ => true,
        }
    }
}

#[derive(Debug)]
struct DeviceEntry {
    descriptor: DeviceDescriptor,
    services: HashMap<String, ServiceState>,
}

impl DeviceEntry {
    fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            services: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<DeviceUuid, DeviceEntry>,
    topology: ZoneTopology,
}

/// Thread-safe registry of devices and their evented state.
pub struct DeviceRegistry {
    inner: RwLock<Inner>,
    changes: broadcast::Sender<PropertyChange>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            changes,
            events,
        }
    }

    /// Insert a device or refresh its descriptor.
    ///
    /// Property state survives an update for every service the device
    /// still exposes.
    pub fn upsert(&self, descriptor: DeviceDescriptor) -> UpsertOutcome {
        let outcome = {
            let mut inner = self.inner.write();
            match inner.devices.get_mut(&descriptor.uuid) {
                None => {
                    inner
                        .devices
                        .insert(descriptor.uuid.clone(), DeviceEntry::new(descriptor.clone()));
                    UpsertOutcome::Added
                }
                Some(entry) if entry.descriptor == descriptor => UpsertOutcome::Unchanged,
                Some(entry) => {
                    entry
                        .services
                        .retain(|service_type, _| descriptor.service(service_type).is_some());
                    entry.descriptor = descriptor.clone();
                    UpsertOutcome::Updated
                }
            }
        };

        match outcome {
            UpsertOutcome::Added => {
                info!(uuid = %descriptor.uuid, name = %descriptor.friendly_name, "device added");
                self.emit(RegistryEvent::DeviceAdded(descriptor));
            }
            UpsertOutcome::Updated => {
                debug!(uuid = %descriptor.uuid, location = %descriptor.location, "device updated");
                self.emit(RegistryEvent::DeviceUpdated(descriptor));
            }
            UpsertOutcome::Unchanged => {}
        }
        outcome
    }

    /// Remove a device together with its property state.
    pub fn remove(&self, uuid: &DeviceUuid) -> Option<DeviceDescriptor> {
        let removed = self.inner.write().devices.remove(uuid)?;
        info!(%uuid, "device removed");
        self.emit(RegistryEvent::DeviceRemoved(uuid.clone()));
        Some(removed.descriptor)
    }

    pub fn get(&self, uuid: &DeviceUuid) -> Option<DeviceDescriptor> {
        self.inner
            .read()
            .devices
            .get(uuid)
            .map(|entry| entry.descriptor.clone())
    }

    pub fn contains(&self, uuid: &DeviceUuid) -> bool {
        self.inner.read().devices.contains_key(uuid)
    }

    /// All devices, ordered by UUID
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        let mut devices: Vec<DeviceDescriptor> = self
            .inner
            .read()
            .devices
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect();
        devices.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        devices
    }

    pub fn len(&self) -> usize {
        self.inner.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().devices.is_empty()
    }

    /// Apply one evented property value.
    ///
    /// Within a subscription only strictly newer sequence numbers overwrite
    /// a stored value. A delivery under a new SID supersedes the previous
    /// subscription, whose SID is retired so that late deliveries carrying
    /// it are treated as stale.
    pub fn apply_property_update(
        &self,
        service: &ServiceRef,
        name: &str,
        value: &str,
        sequence: &EventSequence,
    ) -> UpdateOutcome {
        let outcome = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.devices.get_mut(&service.device) else {
                return UpdateOutcome::UnknownService;
            };
            if entry.descriptor.service(&service.service_type).is_none() {
                return UpdateOutcome::UnknownService;
            }

            let state = entry
                .services
                .entry(service.service_type.clone())
                .or_default();
            if !state.accepts(name, sequence) {
                trace!(%service, name, sid = %sequence.subscription_id, seq = sequence.seq, "stale update");
                return UpdateOutcome::Stale;
            }

            let previous = state.properties.insert(
                name.to_string(),
                StoredProperty {
                    value: value.to_string(),
                    sequence: sequence.clone(),
                },
            );
            match previous {
                Some(previous) if previous.value == value => UpdateOutcome::Unchanged,
                _ => UpdateOutcome::Changed,
            }
        };

        if outcome == UpdateOutcome::Changed {
            if name == ZONE_GROUP_STATE {
                if let Err(e) = self.update_topology(value) {
                    warn!(%service, error = %e, "ignoring unparseable ZoneGroupState");
                }
            }
            // No receivers is fine
            let _ = self.changes.send(PropertyChange {
                device: service.device.clone(),
                service_type: service.service_type.clone(),
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        outcome
    }

    /// Apply every property of a parsed NOTIFY, in document order.
    pub fn apply_event(&self, event: &ServiceEvent) -> Vec<UpdateOutcome> {
        event
            .properties
            .iter()
            .map(|(name, value)| {
                self.apply_property_update(&event.service, name, value, &event.sequence)
            })
            .collect()
    }

    /// Last applied value of a property
    pub fn property(&self, service: &ServiceRef, name: &str) -> Option<String> {
        self.inner
            .read()
            .devices
            .get(&service.device)?
            .services
            .get(&service.service_type)?
            .properties
            .get(name)
            .map(|stored| stored.value.clone())
    }

    /// All stored properties of a service, ordered by name
    pub fn properties(&self, service: &ServiceRef) -> Vec<(String, String)> {
        let inner = self.inner.read();
        let mut properties: Vec<(String, String)> = inner
            .devices
            .get(&service.device)
            .and_then(|entry| entry.services.get(&service.service_type))
            .map(|state| {
                state
                    .properties
                    .iter()
                    .map(|(name, stored)| (name.clone(), stored.value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        properties.sort();
        properties
    }

    /// Snapshot of the derived zone topology
    pub fn topology(&self) -> ZoneTopology {
        self.inner.read().topology.clone()
    }

    /// Rebuild the topology from a `ZoneGroupState` document.
    ///
    /// Emits [`RegistryEvent::TopologyChanged`] if the result differs from
    /// the current topology.
    pub fn update_topology(&self, zone_group_state: &str) -> Result<bool> {
        let topology = parse_zone_group_state(zone_group_state)?;
        let changed = {
            let mut inner = self.inner.write();
            if inner.topology == topology {
                false
            } else {
                inner.topology = topology;
                true
            }
        };

        if changed {
            debug!("zone topology changed");
            self.emit(RegistryEvent::TopologyChanged);
        }
        Ok(changed)
    }

    /// Receive property value changes.
    pub fn property_changes(&self) -> broadcast::Receiver<PropertyChange> {
        self.changes.subscribe()
    }

    /// Receive device membership and topology changes.
    pub fn registry_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::tests::ZONE_GROUP_STATE as TOPOLOGY_XML;
    use proptest::prelude::*;
    use soap_client::PropertySet;
    use sonos_discovery::ServiceDescriptor;

    const AVT: &str = "urn:schemas-upnp-org:service:AVTransport:1";
    const RC: &str = "urn:schemas-upnp-org:service:RenderingControl:1";
    const ZGT: &str = "urn:schemas-upnp-org:service:ZoneGroupTopology:1";

    fn service(service_type: &str, path: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            service_type: service_type.to_string(),
            service_id: format!("urn:upnp-org:serviceId:{}", path),
            control_url: format!("http://192.168.1.20:1400/{}/Control", path),
            event_sub_url: format!("http://192.168.1.20:1400/{}/Event", path),
        }
    }

    fn device(uuid: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            uuid: DeviceUuid::new(uuid),
            location: "http://192.168.1.20:1400/xml/device_description.xml".to_string(),
            base_url: "http://192.168.1.20:1400".to_string(),
            friendly_name: "192.168.1.20 - Sonos One".to_string(),
            room_name: Some("Living Room".to_string()),
            model_name: Some("Sonos One".to_string()),
            services: vec![
                service(AVT, "MediaRenderer/AVTransport"),
                service(RC, "MediaRenderer/RenderingControl"),
                service(ZGT, "ZoneGroupTopology"),
            ],
        }
    }

    fn avt() -> ServiceRef {
        ServiceRef::new("RINCON_AAA", AVT)
    }

    fn seq(sid: &str, seq: u32) -> EventSequence {
        EventSequence::new(sid, seq)
    }

    fn registry() -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        registry.upsert(device("RINCON_AAA"));
        registry
    }

    #[test]
    fn test_upsert_outcomes_and_events() {
        let registry = DeviceRegistry::new();
        let mut events = registry.registry_events();

        assert_eq!(registry.upsert(device("RINCON_AAA")), UpsertOutcome::Added);
        assert_eq!(registry.upsert(device("RINCON_AAA")), UpsertOutcome::Unchanged);

        let mut moved = device("RINCON_AAA");
        moved.location = "http://192.168.1.99:1400/xml/device_description.xml".to_string();
        assert_eq!(registry.upsert(moved.clone()), UpsertOutcome::Updated);

        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::DeviceAdded(device("RINCON_AAA"))
        );
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::DeviceUpdated(moved.clone()));
        assert!(events.try_recv().is_err());
        assert_eq!(registry.get(&DeviceUuid::new("RINCON_AAA")), Some(moved));
    }

    #[test]
    fn test_scenario_late_stopped_does_not_override_playing() {
        let registry = registry();
        let sid = "uuid:RINCON_AAA_sub0000000001";

        assert_eq!(
            registry.apply_property_update(&avt(), "TransportState", "PLAYING", &seq(sid, 1)),
            UpdateOutcome::Changed
        );
        assert_eq!(
            registry.apply_property_update(&avt(), "TransportState", "STOPPED", &seq(sid, 0)),
            UpdateOutcome::Stale
        );
        assert_eq!(
            registry.property(&avt(), "TransportState").as_deref(),
            Some("PLAYING")
        );
    }

    #[test]
    fn test_duplicate_delivery_is_stale() {
        let registry = registry();
        let sid = "uuid:sub-1";

        registry.apply_property_update(&avt(), "TransportState", "PLAYING", &seq(sid, 4));
        assert_eq!(
            registry.apply_property_update(&avt(), "TransportState", "PAUSED_PLAYBACK", &seq(sid, 4)),
            UpdateOutcome::Stale
        );
    }

    #[test]
    fn test_new_sid_supersedes_and_retires_old() {
        let registry = registry();

        registry.apply_property_update(&avt(), "TransportState", "PLAYING", &seq("uuid:sub-1", 9));
        assert_eq!(
            registry.apply_property_update(&avt(), "TransportState", "STOPPED", &seq("uuid:sub-2", 0)),
            UpdateOutcome::Changed
        );
        // Late delivery from the superseded subscription
        assert_eq!(
            registry.apply_property_update(&avt(), "TransportState", "PLAYING", &seq("uuid:sub-1", 10)),
            UpdateOutcome::Stale
        );
        assert_eq!(
            registry.property(&avt(), "TransportState").as_deref(),
            Some("STOPPED")
        );
    }

    #[test]
    fn test_retired_sids_are_bounded() {
        let mut state = ServiceState::default();

        for n in 0..10 {
            let sid = format!("uuid:sub-{}", n);
            assert!(state.accepts("TransportState", &seq(&sid, 0)));
        }

        assert_eq!(state.retired.len(), RETIRED_SID_LIMIT);
        assert_eq!(state.current_sid.as_deref(), Some("uuid:sub-9"));
        assert!(!state.accepts("TransportState", &seq("uuid:sub-8", 1)));
        assert!(!state.accepts("TransportState", &seq("uuid:sub-5", 1)));
    }

    #[test]
    fn test_change_notifications_only_on_new_values() {
        let registry = registry();
        let mut changes = registry.property_changes();

        registry.apply_property_update(&avt(), "TransportState", "PLAYING", &seq("uuid:sub-1", 0));
        assert_eq!(
            registry.apply_property_update(&avt(), "TransportState", "PLAYING", &seq("uuid:sub-1", 1)),
            UpdateOutcome::Unchanged
        );

        assert_eq!(
            changes.try_recv().unwrap(),
            PropertyChange {
                device: DeviceUuid::new("RINCON_AAA"),
                service_type: AVT.to_string(),
                name: "TransportState".to_string(),
                value: "PLAYING".to_string(),
            }
        );
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_unknown_device_or_service_is_ignored() {
        let registry = registry();

        assert_eq!(
            registry.apply_property_update(
                &ServiceRef::new("RINCON_ZZZ", AVT),
                "TransportState",
                "PLAYING",
                &seq("uuid:sub-1", 0)
            ),
            UpdateOutcome::UnknownService
        );
        assert_eq!(
            registry.apply_property_update(
                &ServiceRef::new("RINCON_AAA", "urn:schemas-upnp-org:service:Queue:1"),
                "UpdateID",
                "7",
                &seq("uuid:sub-1", 0)
            ),
            UpdateOutcome::UnknownService
        );
        assert!(registry.properties(&avt()).is_empty());
    }

    #[test]
    fn test_remove_drops_property_state() {
        let registry = registry();
        registry.apply_property_update(&avt(), "TransportState", "PLAYING", &seq("uuid:sub-1", 0));

        let mut events = registry.registry_events();
        assert!(registry.remove(&DeviceUuid::new("RINCON_AAA")).is_some());
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::DeviceRemoved(DeviceUuid::new("RINCON_AAA"))
        );
        assert!(registry.remove(&DeviceUuid::new("RINCON_AAA")).is_none());

        registry.upsert(device("RINCON_AAA"));
        assert_eq!(registry.property(&avt(), "TransportState"), None);
    }

    #[test]
    fn test_update_keeps_state_of_remaining_services() {
        let registry = registry();
        let rc = ServiceRef::new("RINCON_AAA", RC);
        registry.apply_property_update(&avt(), "TransportState", "PLAYING", &seq("uuid:sub-1", 0));
        registry.apply_property_update(&rc, "Volume/Master", "36", &seq("uuid:sub-2", 0));

        let mut reduced = device("RINCON_AAA");
        reduced.services.retain(|s| s.service_type != RC);
        assert_eq!(registry.upsert(reduced), UpsertOutcome::Updated);

        assert_eq!(registry.property(&avt(), "TransportState").as_deref(), Some("PLAYING"));
        assert_eq!(registry.property(&rc, "Volume/Master"), None);
    }

    #[test]
    fn test_zone_group_state_rebuilds_topology() {
        let registry = registry();
        let mut events = registry.registry_events();
        let zgt = ServiceRef::new("RINCON_AAA", ZGT);

        registry.apply_property_update(&zgt, ZONE_GROUP_STATE, TOPOLOGY_XML, &seq("uuid:sub-3", 0));

        assert_eq!(events.try_recv().unwrap(), RegistryEvent::TopologyChanged);
        let topology = registry.topology();
        assert_eq!(topology.groups().len(), 3);
        assert_eq!(
            topology.coordinator_of(&DeviceUuid::new("RINCON_BBB")),
            Some(&DeviceUuid::new("RINCON_AAA"))
        );

        // Same document again: no topology event
        assert_eq!(registry.update_topology(TOPOLOGY_XML), Ok(false));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_apply_event() {
        let registry = registry();
        let event = ServiceEvent {
            service: avt(),
            sequence: seq("uuid:sub-1", 0),
            properties: properties_from(&[("TransportState", "PLAYING")]),
        };

        assert_eq!(registry.apply_event(&event), vec![UpdateOutcome::Changed]);
        assert_eq!(registry.apply_event(&event), vec![UpdateOutcome::Stale]);
    }

    fn properties_from(pairs: &[(&str, &str)]) -> PropertySet {
        let body: String = pairs
            .iter()
            .map(|(name, value)| format!("<e:property><{0}>{1}</{0}></e:property>", name, value))
            .collect();
        soap_client::event::parse_property_set(&format!(
            r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">{}</e:propertyset>"#,
            body
        ))
        .unwrap()
    }

    proptest! {
        #[test]
        fn prop_highest_sequence_wins(
            deliveries in prop::collection::vec(0u32..1000, 1..40)
                .prop_map(|mut seqs| { seqs.sort_unstable(); seqs.dedup(); seqs })
                .prop_shuffle()
        ) {
            let registry = registry();
            let sid = "uuid:sub-1";

            for n in &deliveries {
                registry.apply_property_update(&avt(), "Volume/Master", &format!("value-{}", n), &seq(sid, *n));
            }

            let highest = deliveries.iter().max().copied().unwrap_or_default();
            prop_assert_eq!(
                registry.property(&avt(), "Volume/Master"),
                Some(format!("value-{}", highest))
            );
        }
    }
}
