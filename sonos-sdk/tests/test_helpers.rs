//! Test helpers for SDK integration tests.
//!
//! - A scripted Sonos One answering description, SOAP and GENA requests
//! - A NOTIFY client standing in for the player's event delivery
//! - SSDP advertisements for driving a discovery listener

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use soap_client::mock::MockTransport;
use soap_client::{HttpMethod, HttpRequest, HttpResponse};
use sonos_discovery::ssdp::{SsdpKind, SsdpMessage};
use tokio::sync::mpsc;

pub const LOCATION: &str = "http://192.168.1.20:1400/xml/device_description.xml";
pub const UUID: &str = "RINCON_AAA";

const ZONE_GROUP_STATE: &str = r#"<ZoneGroupState><ZoneGroups><ZoneGroup Coordinator="RINCON_AAA" ID="RINCON_AAA:12"><ZoneGroupMember UUID="RINCON_AAA" Location="http://192.168.1.20:1400/xml/device_description.xml" ZoneName="Living Room"/><ZoneGroupMember UUID="RINCON_BBB" Location="http://192.168.1.21:1400/xml/device_description.xml" ZoneName="Kitchen"/></ZoneGroup></ZoneGroups></ZoneGroupState>"#;

/// Route test logs through the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn description() -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8" ?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:ZonePlayer:1</deviceType>
    <friendlyName>192.168.1.20 - Sonos One</friendlyName>
    <manufacturer>Sonos, Inc.</manufacturer>
    <modelName>Sonos One</modelName>
    <UDN>uuid:{uuid}</UDN>
    <roomName>Living Room</roomName>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:ZoneGroupTopology:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:ZoneGroupTopology</serviceId>
        <controlURL>/ZoneGroupTopology/Control</controlURL>
        <eventSubURL>/ZoneGroupTopology/Event</eventSubURL>
        <SCPDURL>/xml/ZoneGroupTopology1.xml</SCPDURL>
      </service>
    </serviceList>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
        <friendlyName>Living Room - Sonos One Media Renderer</friendlyName>
        <manufacturer>Sonos, Inc.</manufacturer>
        <UDN>uuid:{uuid}_MR</UDN>
        <serviceList>
          <service>
            <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
            <serviceId>urn:upnp-org:serviceId:RenderingControl</serviceId>
            <controlURL>/MediaRenderer/RenderingControl/Control</controlURL>
            <eventSubURL>/MediaRenderer/RenderingControl/Event</eventSubURL>
            <SCPDURL>/xml/RenderingControl1.xml</SCPDURL>
          </service>
          <service>
            <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
            <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
            <controlURL>/MediaRenderer/AVTransport/Control</controlURL>
            <eventSubURL>/MediaRenderer/AVTransport/Event</eventSubURL>
            <SCPDURL>/xml/AVTransport1.xml</SCPDURL>
          </service>
        </serviceList>
      </device>
    </deviceList>
  </device>
</root>"#,
        uuid = UUID
    )
}

fn envelope(body: &str) -> String {
    format!(
        r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body>{}</s:Body></s:Envelope>"#,
        body
    )
}

fn fault(code: u16) -> HttpResponse {
    HttpResponse::new(500).with_body(envelope(&format!(
        r#"<s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring><detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0"><errorCode>{}</errorCode></UPnPError></detail></s:Fault>"#,
        code
    )))
}

fn escape(xml: &str) -> String {
    xml.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn control(request: &HttpRequest) -> HttpResponse {
    let action = request.header_value("SOAPACTION").unwrap_or_default();
    if action.ends_with("#GetZoneGroupState\"") {
        HttpResponse::new(200).with_body(envelope(&format!(
            r#"<u:GetZoneGroupStateResponse xmlns:u="urn:schemas-upnp-org:service:ZoneGroupTopology:1"><ZoneGroupState>{}</ZoneGroupState></u:GetZoneGroupStateResponse>"#,
            escape(ZONE_GROUP_STATE)
        )))
    } else if action.ends_with("#Play\"") {
        HttpResponse::new(200).with_body(envelope(
            r#"<u:PlayResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"></u:PlayResponse>"#,
        ))
    } else {
        // Everything else fails the way a player refuses an action
        fault(501)
    }
}

/// A Sonos One at [`LOCATION`] issuing sequential SIDs
/// (`uuid:RINCON_AAA_subNNNNNNNNNN`).
pub fn simulated_player() -> Arc<MockTransport> {
    let next_sid = AtomicU32::new(1);
    Arc::new(MockTransport::new(move |request| match request.method {
        HttpMethod::Get if request.url == LOCATION => {
            Ok(HttpResponse::new(200).with_body(description()))
        }
        HttpMethod::Post => Ok(control(request)),
        HttpMethod::Subscribe if request.header_value("SID").is_none() => {
            let n = next_sid.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse::new(200)
                .with_header("SID", format!("uuid:{}_sub{:010}", UUID, n))
                .with_header("TIMEOUT", "Second-1800"))
        }
        HttpMethod::Subscribe => Ok(HttpResponse::new(200).with_header("TIMEOUT", "Second-1800")),
        HttpMethod::Unsubscribe => Ok(HttpResponse::new(200)),
        _ => Ok(HttpResponse::new(404)),
    }))
}

/// Deliver a NOTIFY the way a player does and return the response status.
pub async fn send_notify(url: &str, sid: &str, seq: u32, body: &str) -> u16 {
    let client = reqwest::Client::new();
    let response = client
        .request(reqwest::Method::from_bytes(b"NOTIFY").unwrap(), url)
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .header("NT", "upnp:event")
        .header("NTS", "upnp:propchange")
        .header("SID", sid)
        .header("SEQ", seq.to_string())
        .body(body.to_string())
        .send()
        .await
        .expect("NOTIFY request failed");
    response.status().as_u16()
}

/// AVTransport LastChange body carrying a transport state.
pub fn transport_state_event(state: &str) -> String {
    format!(
        r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><LastChange>&lt;Event xmlns=&quot;urn:schemas-upnp-org:metadata-1-0/AVT/&quot;&gt;&lt;InstanceID val=&quot;0&quot;&gt;&lt;TransportState val=&quot;{}&quot;/&gt;&lt;/InstanceID&gt;&lt;/Event&gt;</LastChange></e:property></e:propertyset>"#,
        state
    )
}

/// Plain propertyset with a single variable.
pub fn property_event(name: &str, value: &str) -> String {
    format!(
        r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><{0}>{1}</{0}></e:property></e:propertyset>"#,
        name, value
    )
}

/// `ssdp:alive` for the simulated player.
pub fn alive() -> SsdpMessage {
    SsdpMessage {
        kind: SsdpKind::Alive,
        location: Some(LOCATION.to_string()),
        target: "urn:schemas-upnp-org:device:ZonePlayer:1".to_string(),
        usn: format!("uuid:{}::urn:schemas-upnp-org:device:ZonePlayer:1", UUID),
        server: Some("Linux UPnP/1.0 Sonos/70.3-88200 (ZPS12)".to_string()),
        max_age: Some(Duration::from_secs(1800)),
    }
}

/// `ssdp:byebye` for the simulated player.
pub fn byebye() -> SsdpMessage {
    SsdpMessage {
        kind: SsdpKind::ByeBye,
        location: None,
        target: "urn:schemas-upnp-org:device:ZonePlayer:1".to_string(),
        usn: format!("uuid:{}::urn:schemas-upnp-org:device:ZonePlayer:1", UUID),
        server: None,
        max_age: None,
    }
}

/// Stream of SSDP messages fed by the returned sender.
pub fn advertisements() -> (
    mpsc::UnboundedSender<SsdpMessage>,
    impl futures::Stream<Item = SsdpMessage> + Send + 'static,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let messages = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|message| (message, rx))
    });
    (tx, messages)
}
