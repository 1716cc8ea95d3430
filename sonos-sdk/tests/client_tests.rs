//! End-to-end tests for SonosClient against a simulated player and a
//! loopback callback server.

mod test_helpers;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use soap_client::mock::MockTransport;
use soap_client::HttpMethod;
use sonos_discovery::{DiscoveryConfig, DiscoveryListener};
use sonos_sdk::{
    CallbackConfig, DeviceUuid, PropertyChange, RegistryEvent, SdkError, ServiceRef,
    SonosClient, SubscriptionEvent, SubscriptionState,
};
use tokio::sync::broadcast;
use test_helpers::*;

const AVT: &str = "urn:schemas-upnp-org:service:AVTransport:1";

async fn client() -> (SonosClient, Arc<MockTransport>) {
    init_tracing();
    let transport = simulated_player();
    let client = SonosClient::builder()
        .with_transport(transport.clone())
        .with_callback_config(CallbackConfig::loopback())
        .start()
        .await
        .expect("Failed to start client");
    client.add_device(LOCATION).await.expect("Failed to add device");
    (client, transport)
}

fn uuid() -> DeviceUuid {
    DeviceUuid::new(UUID)
}

async fn next_change<S>(changes: &mut S) -> PropertyChange
where
    S: futures::Stream<Item = PropertyChange> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(2), changes.next())
        .await
        .expect("Timeout waiting for property change")
        .expect("Property change stream ended")
}

#[tokio::test]
async fn test_late_event_does_not_regress_transport_state() {
    let (client, _transport) = client().await;
    let mut changes = client.property_changes();

    let sid = client
        .subscribe(&uuid(), "AVTransport")
        .unwrap()
        .wait_active()
        .await
        .unwrap();
    let url = format!("{}/{}/AVTransport", client.callback_url(), UUID);

    assert_eq!(send_notify(&url, &sid, 1, &transport_state_event("PLAYING")).await, 200);
    assert_eq!(send_notify(&url, &sid, 0, &transport_state_event("STOPPED")).await, 200);
    assert_eq!(send_notify(&url, &sid, 2, &property_event("CurrentPlayMode", "NORMAL")).await, 200);

    let first = next_change(&mut changes).await;
    assert_eq!(first.device, uuid());
    assert_eq!(first.service_type, AVT);
    assert_eq!((first.name.as_str(), first.value.as_str()), ("TransportState", "PLAYING"));

    // Events are applied in order, so STOPPED has been judged by now
    let second = next_change(&mut changes).await;
    assert_eq!(second.name, "CurrentPlayMode");

    assert_eq!(
        client.property(&uuid(), "AVTransport", "TransportState").as_deref(),
        Some("PLAYING")
    );

    client.shutdown().await;
}

#[tokio::test]
async fn test_action_fault_is_not_retried() {
    let (client, transport) = client().await;

    let err = client
        .invoke(&uuid(), "RenderingControl", "SetVolume", &[("InstanceID", "0")])
        .await
        .unwrap_err();

    assert!(matches!(err, SdkError::ActionFault { code: 501, .. }));
    assert_eq!(
        transport.count_where(|r| r.method == HttpMethod::Post),
        1
    );

    client.shutdown().await;
}

#[tokio::test]
async fn test_invoke_resolves_short_service_names() {
    let (client, transport) = client().await;

    client
        .invoke(&uuid(), "AVTransport", "Play", &[("InstanceID", "0"), ("Speed", "1")])
        .await
        .unwrap();

    let posts: Vec<String> = transport
        .requests()
        .into_iter()
        .filter(|r| r.method == HttpMethod::Post)
        .map(|r| r.url)
        .collect();
    assert_eq!(
        posts,
        vec!["http://192.168.1.20:1400/MediaRenderer/AVTransport/Control".to_string()]
    );

    client.shutdown().await;
}

#[tokio::test]
async fn test_unknown_device_and_service() {
    let (client, transport) = client().await;
    let before = transport.request_count();

    let err = client
        .invoke(&DeviceUuid::new("RINCON_ZZZ"), "AVTransport", "Play", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, SdkError::DeviceNotFound(_)));

    let err = client.subscribe(&uuid(), "Queue").unwrap_err();
    assert!(matches!(err, SdkError::ServiceNotFound { .. }));

    assert_eq!(transport.request_count(), before);
    client.shutdown().await;
}

#[tokio::test]
async fn test_add_device_from_unreachable_location() {
    let (client, _transport) = client().await;

    let err = client
        .add_device("http://192.168.1.99:1400/xml/device_description.xml")
        .await
        .unwrap_err();

    assert!(matches!(err, SdkError::DeviceUnreachable { .. }));
    assert_eq!(client.devices().len(), 1);
    client.shutdown().await;
}

#[tokio::test]
async fn test_refresh_topology() {
    let (client, _transport) = client().await;
    assert!(client.topology().is_empty());

    let topology = client.refresh_topology().await.unwrap();

    assert_eq!(topology.groups().len(), 1);
    assert_eq!(
        topology.coordinator_of(&DeviceUuid::new("RINCON_BBB")),
        Some(&uuid())
    );
    assert_eq!(client.topology(), topology);
    client.shutdown().await;
}

#[tokio::test]
async fn test_resubscribe_after_unsubscribe_gets_fresh_sid() {
    let (client, _transport) = client().await;

    let mut first = client.subscribe(&uuid(), "AVTransport").unwrap();
    let first_sid = first.wait_active().await.unwrap();

    client.unsubscribe(&uuid(), "AVTransport").await.unwrap();
    assert_eq!(first.state(), SubscriptionState::Unsubscribed);

    let second_sid = client
        .subscribe(&uuid(), "AVTransport")
        .unwrap()
        .wait_active()
        .await
        .unwrap();
    assert_ne!(first_sid, second_sid);

    client.shutdown().await;
}

#[tokio::test]
async fn test_removing_device_ends_its_subscriptions() {
    let (client, transport) = client().await;
    let mut lifecycle = client.subscription_events();

    client
        .subscribe(&uuid(), "AVTransport")
        .unwrap()
        .wait_active()
        .await
        .unwrap();
    assert!(matches!(
        lifecycle.recv().await.unwrap(),
        SubscriptionEvent::Established { .. }
    ));

    assert!(client.remove_device(&uuid()).is_some());

    let ended = tokio::time::timeout(Duration::from_secs(2), lifecycle.recv())
        .await
        .expect("Timeout waiting for subscription to end")
        .unwrap();
    assert!(matches!(ended, SubscriptionEvent::Ended { .. }));
    assert_eq!(
        transport.count_where(|r| r.method == HttpMethod::Unsubscribe),
        1
    );
    assert!(client.subscriptions().tracked().is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn test_notify_with_unknown_sid_changes_nothing() {
    let (client, _transport) = client().await;
    client
        .subscribe(&uuid(), "AVTransport")
        .unwrap()
        .wait_active()
        .await
        .unwrap();
    let url = format!("{}/{}/AVTransport", client.callback_url(), UUID);

    let status = send_notify(&url, "uuid:RINCON_AAA_sub9999999999", 0, &transport_state_event("PLAYING")).await;

    assert_eq!(status, 412);
    assert_eq!(client.property(&uuid(), "AVTransport", "TransportState"), None);
    client.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_after_shutdown_fails() {
    let (client, _transport) = client().await;
    client.shutdown().await;

    let err = client.subscribe(&uuid(), "AVTransport").unwrap_err();
    assert!(matches!(err, SdkError::Subscription(_)));
}

async fn next_lifecycle(lifecycle: &mut broadcast::Receiver<SubscriptionEvent>) -> SubscriptionEvent {
    tokio::time::timeout(Duration::from_secs(2), lifecycle.recv())
        .await
        .expect("Timeout waiting for subscription event")
        .expect("Subscription event channel closed")
}

#[tokio::test]
async fn test_moved_device_is_resubscribed_at_new_address() {
    let (client, transport) = client().await;
    let mut lifecycle = client.subscription_events();

    let old_sid = client
        .subscribe(&uuid(), "AVTransport")
        .unwrap()
        .wait_active()
        .await
        .unwrap();

    let mut moved = client.device(&uuid()).unwrap();
    moved.location = moved.location.replace("192.168.1.20", "192.168.1.99");
    moved.base_url = moved.base_url.replace("192.168.1.20", "192.168.1.99");
    for service in &mut moved.services {
        service.control_url = service.control_url.replace("192.168.1.20", "192.168.1.99");
        service.event_sub_url = service.event_sub_url.replace("192.168.1.20", "192.168.1.99");
    }
    client.registry().upsert(moved);

    assert_eq!(
        next_lifecycle(&mut lifecycle).await,
        SubscriptionEvent::Established {
            service: ServiceRef::new(uuid(), AVT),
            subscription_id: old_sid.clone(),
        }
    );
    assert!(matches!(next_lifecycle(&mut lifecycle).await, SubscriptionEvent::Ended { .. }));
    let new_sid = match next_lifecycle(&mut lifecycle).await {
        SubscriptionEvent::Established { subscription_id, .. } => subscription_id,
        other => panic!("Expected Established, got {:?}", other),
    };
    assert_ne!(new_sid, old_sid);

    let subscribes: Vec<String> = transport
        .requests()
        .into_iter()
        .filter(|r| r.method == HttpMethod::Subscribe && r.header_value("SID").is_none())
        .map(|r| r.url)
        .collect();
    assert_eq!(
        subscribes.last().map(String::as_str),
        Some("http://192.168.1.99:1400/MediaRenderer/AVTransport/Event")
    );

    client.shutdown().await;
}

#[tokio::test]
async fn test_renamed_device_keeps_its_subscription() {
    let (client, transport) = client().await;
    let mut events = client.registry_events();
    let sid = client
        .subscribe(&uuid(), "AVTransport")
        .unwrap()
        .wait_active()
        .await
        .unwrap();

    let mut renamed = client.device(&uuid()).unwrap();
    renamed.room_name = Some("Den".to_string());
    client.registry().upsert(renamed);
    assert!(matches!(events.recv().await.unwrap(), RegistryEvent::DeviceUpdated(_)));

    // Give the registry bridge a chance to act
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        transport.count_where(|r| r.method == HttpMethod::Subscribe && r.header_value("SID").is_none()),
        1
    );
    assert_eq!(transport.count_where(|r| r.method == HttpMethod::Unsubscribe), 0);
    assert_eq!(
        client.subscriptions().state(&ServiceRef::new(uuid(), AVT)).sid(),
        Some(sid.as_str())
    );

    client.shutdown().await;
}

#[tokio::test]
async fn test_listener_byebye_removes_device_and_ends_subscriptions() {
    init_tracing();
    let transport = simulated_player();
    let (advertise, messages) = advertisements();
    let (listener, device_events) =
        DiscoveryListener::from_messages(messages, transport.clone(), DiscoveryConfig::default());

    let client = SonosClient::builder()
        .with_transport(transport.clone())
        .with_callback_config(CallbackConfig::loopback())
        .with_listener(listener, device_events)
        .start()
        .await
        .expect("Failed to start client");
    let mut registry_events = client.registry_events();
    let mut lifecycle = client.subscription_events();

    advertise.send(alive()).unwrap();
    let added = tokio::time::timeout(Duration::from_secs(2), registry_events.recv())
        .await
        .expect("Timeout waiting for device")
        .unwrap();
    assert!(matches!(added, RegistryEvent::DeviceAdded(ref device) if device.uuid == uuid()));

    client
        .subscribe(&uuid(), "AVTransport")
        .unwrap()
        .wait_active()
        .await
        .unwrap();
    assert!(matches!(next_lifecycle(&mut lifecycle).await, SubscriptionEvent::Established { .. }));

    advertise.send(byebye()).unwrap();
    let removed = tokio::time::timeout(Duration::from_secs(2), registry_events.recv())
        .await
        .expect("Timeout waiting for removal")
        .unwrap();
    assert_eq!(removed, RegistryEvent::DeviceRemoved(uuid()));

    assert!(matches!(next_lifecycle(&mut lifecycle).await, SubscriptionEvent::Ended { .. }));
    assert!(client.device(&uuid()).is_none());
    assert!(client.subscriptions().tracked().is_empty());
    assert_eq!(transport.count_where(|r| r.method == HttpMethod::Unsubscribe), 1);

    client.shutdown().await;
}
