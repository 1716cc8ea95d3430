//! SSDP (Simple Service Discovery Protocol) messages and sockets
//!
//! This module parses M-SEARCH responses and NOTIFY advertisements and owns
//! the UDP sockets used to send searches and listen on the multicast group.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use futures::stream::{self, Stream};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{DiscoveryError, Result};
use crate::{DeviceUuid, DiscoveryConfig};

pub(crate) const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub(crate) const MULTICAST_PORT: u16 = 1900;

/// What kind of SSDP datagram was received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsdpKind {
    /// Unicast reply to an M-SEARCH
    Response,
    /// `NOTIFY` with `NTS: ssdp:alive`
    Alive,
    /// `NOTIFY` with `NTS: ssdp:byebye`
    ByeBye,
}

/// A parsed SSDP datagram
#[derive(Debug, Clone, PartialEq)]
pub struct SsdpMessage {
    pub kind: SsdpKind,
    /// Description URL; absent on byebye
    pub location: Option<String>,
    /// `ST` for responses, `NT` for notifications
    pub target: String,
    pub usn: String,
    pub server: Option<String>,
    /// Lease length from `CACHE-CONTROL: max-age`
    pub max_age: Option<Duration>,
}

impl SsdpMessage {
    /// Device identity carried in the USN
    pub fn uuid(&self) -> DeviceUuid {
        DeviceUuid::new(&self.usn)
    }

    /// Early filter applied before any description fetch
    pub fn is_likely_sonos(&self) -> bool {
        if self.target.contains("ZonePlayer") || self.usn.contains("RINCON") {
            return true;
        }
        self.server
            .as_deref()
            .map(|server| server.to_ascii_lowercase().contains("sonos"))
            .unwrap_or(false)
    }
}

/// Build the M-SEARCH request datagram
pub(crate) fn build_msearch(search_target: &str, mx: u8) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\
         USER-AGENT: sonos-rs/1.0 UPnP/1.0\r\n\
         \r\n",
        mx, search_target
    )
}

/// Parse an SSDP datagram. Returns `None` for anything that is not a
/// search response or a usable NOTIFY (including other clients' M-SEARCHes).
pub fn parse_message(datagram: &str) -> Option<SsdpMessage> {
    let mut lines = datagram.lines();
    let start_line = lines.next()?.trim();

    let is_response = start_line
        .get(..5)
        .map(|p| p.eq_ignore_ascii_case("HTTP/"))
        .unwrap_or(false);
    let is_notify = start_line
        .get(..6)
        .map(|p| p.eq_ignore_ascii_case("NOTIFY"))
        .unwrap_or(false);
    if !is_response && !is_notify {
        return None;
    }

    let mut location = None;
    let mut target = None;
    let mut usn = None;
    let mut server = None;
    let mut nts = None;
    let mut max_age = None;

    for line in lines {
        let line = line.trim();

        if let Some(value) = extract_header_value(line, "LOCATION:") {
            location = Some(value);
        } else if let Some(value) = extract_header_value(line, "ST:") {
            target = Some(value);
        } else if let Some(value) = extract_header_value(line, "NT:") {
            target = Some(value);
        } else if let Some(value) = extract_header_value(line, "NTS:") {
            nts = Some(value);
        } else if let Some(value) = extract_header_value(line, "USN:") {
            usn = Some(value);
        } else if let Some(value) = extract_header_value(line, "SERVER:") {
            server = Some(value);
        } else if let Some(value) = extract_header_value(line, "CACHE-CONTROL:") {
            max_age = parse_max_age(&value);
        }
    }

    let kind = if is_response {
        SsdpKind::Response
    } else {
        match nts.as_deref() {
            Some(nts) if nts.eq_ignore_ascii_case("ssdp:alive") => SsdpKind::Alive,
            Some(nts) if nts.eq_ignore_ascii_case("ssdp:byebye") => SsdpKind::ByeBye,
            _ => return None,
        }
    };

    // Only byebye may omit the location
    if kind != SsdpKind::ByeBye && location.is_none() {
        return None;
    }

    Some(SsdpMessage {
        kind,
        location,
        target: target?,
        usn: usn?,
        server,
        max_age,
    })
}

/// Extract header value from a line like "HEADER: value"
fn extract_header_value(line: &str, header: &str) -> Option<String> {
    let name = line.get(..header.len())?;
    if line.len() > header.len() && name.eq_ignore_ascii_case(header) {
        Some(line[header.len()..].trim().to_string())
    } else {
        None
    }
}

/// Parse `max-age = 1800` out of a CACHE-CONTROL value
fn parse_max_age(value: &str) -> Option<Duration> {
    value.split(',').find_map(|directive| {
        let (name, seconds) = directive.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        seconds.trim().parse::<u64>().ok().map(Duration::from_secs)
    })
}

/// Socket for sending M-SEARCH and receiving the unicast replies.
pub(crate) async fn open_search_socket(config: &DiscoveryConfig) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DiscoveryError::NetworkError(format!("Failed to create UDP socket: {}", e)))?;

    // UPnP 1.0 requires a TTL of 4 for SSDP multicast
    if let Err(e) = socket.set_multicast_ttl_v4(4) {
        warn!(error = %e, "failed to set multicast TTL");
    }
    if let Err(e) = socket.set_multicast_loop_v4(true) {
        warn!(error = %e, "failed to enable multicast loop");
    }

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    socket
        .bind(&bind_addr.into())
        .map_err(|e| DiscoveryError::NetworkError(format!("Failed to bind UDP socket: {}", e)))?;
    let socket = into_tokio(socket)?;

    let request = build_msearch(&config.search_target, config.mx);
    let destination = SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT);
    for _ in 0..config.search_repeats.max(1) {
        socket
            .send_to(request.as_bytes(), destination)
            .await
            .map_err(|e| DiscoveryError::NetworkError(format!("Failed to send M-SEARCH: {}", e)))?;
    }
    debug!(target = %config.search_target, "sent M-SEARCH");

    Ok(socket)
}

/// Socket bound to the SSDP port and joined to the multicast group.
pub(crate) fn open_multicast_socket() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DiscoveryError::NetworkError(format!("Failed to create UDP socket: {}", e)))?;

    // Other SSDP listeners on this host share the port
    if let Err(e) = socket.set_reuse_address(true) {
        warn!(error = %e, "failed to set SO_REUSEADDR");
    }
    #[cfg(unix)]
    if let Err(e) = socket.set_reuse_port(true) {
        warn!(error = %e, "failed to set SO_REUSEPORT");
    }

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT));
    socket
        .bind(&bind_addr.into())
        .map_err(|e| DiscoveryError::NetworkError(format!("Failed to bind SSDP port: {}", e)))?;
    socket
        .join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| {
            DiscoveryError::NetworkError(format!("Failed to join multicast group: {}", e))
        })?;

    into_tokio(socket)
}

fn into_tokio(socket: Socket) -> Result<UdpSocket> {
    socket
        .set_nonblocking(true)
        .map_err(|e| DiscoveryError::NetworkError(e.to_string()))?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| DiscoveryError::NetworkError(e.to_string()))
}

/// Stream of parsed datagrams from `socket`, ending at `deadline` if given.
///
/// Unparseable datagrams are skipped; a socket error ends the stream.
pub(crate) fn datagrams(
    socket: UdpSocket,
    deadline: Option<Instant>,
) -> impl Stream<Item = SsdpMessage> + Send {
    stream::unfold(socket, move |socket| async move {
        let mut buffer = [0u8; 2048];
        loop {
            let received = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await {
                        Ok(received) => received,
                        Err(_) => return None,
                    }
                }
                None => socket.recv_from(&mut buffer).await,
            };

            match received {
                Ok((size, from)) => {
                    let parsed = std::str::from_utf8(&buffer[..size])
                        .ok()
                        .and_then(parse_message);
                    match parsed {
                        Some(message) => return Some((message, socket)),
                        None => trace!(%from, "ignoring SSDP datagram"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "SSDP socket error");
                    return None;
                }
            }
        }
    })
}
