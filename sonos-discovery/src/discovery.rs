//! Active search.
//!
//! A search:
//! 1. Sends SSDP M-SEARCH requests for Sonos ZonePlayer devices
//! 2. Receives and filters SSDP responses until the timeout elapses
//! 3. Fetches each new device's description through the transport
//! 4. Yields the parsed descriptors
//!
//! Dropping the stream stops the search at whatever point it is suspended.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use soap_client::Transport;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::device::describe;
use crate::ssdp::{self, SsdpKind, SsdpMessage};
use crate::{DeviceDescriptor, DiscoveryConfig};

/// Search the local network for Sonos devices.
///
/// The returned stream ends once `timeout` has elapsed and every pending
/// reply has been handled. Devices that answer more than once are reported
/// once; devices whose description cannot be fetched or parsed are logged
/// and skipped. Each call performs an independent search.
pub fn search(
    transport: Arc<dyn Transport>,
    config: DiscoveryConfig,
    timeout: Duration,
) -> BoxStream<'static, DeviceDescriptor> {
    let replies = stream::once(async move {
        match ssdp::open_search_socket(&config).await {
            Ok(socket) => ssdp::datagrams(socket, Some(Instant::now() + timeout)).boxed(),
            Err(e) => {
                warn!(error = %e, "discovery search could not start");
                stream::empty().boxed()
            }
        }
    })
    .flatten();

    describe_unique(replies, transport).boxed()
}

/// Turn a stream of SSDP replies into descriptors, one per device.
pub(crate) fn describe_unique<S>(
    replies: S,
    transport: Arc<dyn Transport>,
) -> impl Stream<Item = DeviceDescriptor> + Send
where
    S: Stream<Item = SsdpMessage> + Send + 'static,
{
    let state = (replies.boxed(), HashSet::new(), transport);
    stream::unfold(state, |(mut replies, mut seen, transport)| async move {
        while let Some(reply) = replies.next().await {
            if reply.kind == SsdpKind::ByeBye || !reply.is_likely_sonos() {
                continue;
            }
            let Some(location) = reply.location.clone() else {
                continue;
            };
            if !seen.insert(reply.uuid()) {
                continue;
            }

            match describe(transport.as_ref(), &location).await {
                Ok(device) => {
                    debug!(uuid = %device.uuid, %location, "discovered device");
                    return Some((device, (replies, seen, transport)));
                }
                Err(e) => warn!(error = %e, %location, "skipping device"),
            }
        }
        None
    })
}
