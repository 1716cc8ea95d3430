//! Event processing
//!
//! Turns raw NOTIFY payloads from the callback server into [`ServiceEvent`]s:
//! the SID is resolved to the service it belongs to and the body is parsed
//! into a flat property set. Deliveries for retired SIDs and malformed
//! bodies are logged and dropped.

use std::sync::Arc;

use callback_server::NotificationPayload;
use parking_lot::Mutex;
use soap_client::event::parse_property_set;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::EventProcessingError;
use crate::event::{EventSequence, ServiceEvent};
use crate::manager::SidTable;

/// Statistics about event processing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventProcessorStats {
    /// NOTIFY payloads received from the callback server
    pub events_received: u64,
    /// Events forwarded downstream
    pub events_processed: u64,
    /// Payloads whose SID no longer maps to a subscription
    pub unknown_subscriptions: u64,
    /// Payloads whose body could not be parsed
    pub parse_errors: u64,
}

/// Maps NOTIFY payloads to service events, in arrival order.
#[derive(Clone)]
pub struct EventProcessor {
    sids: SidTable,
    event_sender: mpsc::Sender<ServiceEvent>,
    stats: Arc<Mutex<EventProcessorStats>>,
}

impl EventProcessor {
    pub fn new(sids: SidTable, event_sender: mpsc::Sender<ServiceEvent>) -> Self {
        Self {
            sids,
            event_sender,
            stats: Arc::new(Mutex::new(EventProcessorStats::default())),
        }
    }

    /// Process a single NOTIFY payload from the callback server.
    pub async fn process_notification(
        &self,
        payload: NotificationPayload,
    ) -> Result<(), EventProcessingError> {
        self.stats.lock().events_received += 1;

        let Some(service) = self.sids.resolve(&payload.subscription_id) else {
            self.stats.lock().unknown_subscriptions += 1;
            return Err(EventProcessingError::UnknownSubscription(
                payload.subscription_id,
            ));
        };

        let properties = parse_property_set(&payload.event_xml).map_err(|e| {
            self.stats.lock().parse_errors += 1;
            EventProcessingError::Parsing(e)
        })?;

        debug!(
            %service,
            sid = %payload.subscription_id,
            seq = payload.seq,
            properties = properties.len(),
            "processed event"
        );

        let event = ServiceEvent {
            service,
            sequence: EventSequence::new(payload.subscription_id, payload.seq),
            properties,
        };
        self.event_sender
            .send(event)
            .await
            .map_err(|_| EventProcessingError::ChannelClosed)?;

        self.stats.lock().events_processed += 1;
        Ok(())
    }

    /// Consume payloads until the callback server's channel closes or the
    /// downstream receiver goes away.
    pub async fn run(self, mut notifications: mpsc::UnboundedReceiver<NotificationPayload>) {
        debug!("starting event processing");

        while let Some(payload) = notifications.recv().await {
            match self.process_notification(payload).await {
                Ok(()) => {}
                Err(EventProcessingError::ChannelClosed) => break,
                Err(e) => warn!(error = %e, "dropping event"),
            }
        }

        info!(stats = ?self.stats(), "event processing stopped");
    }

    pub fn stats(&self) -> EventProcessorStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceRef;

    const AVT: &str = "urn:schemas-upnp-org:service:AVTransport:1";
    const SID: &str = "uuid:RINCON_AAA_sub0000000001";

    fn avt_event(state: &str) -> String {
        format!(
            r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><LastChange>&lt;Event xmlns=&quot;urn:schemas-upnp-org:metadata-1-0/AVT/&quot;&gt;&lt;InstanceID val=&quot;0&quot;&gt;&lt;TransportState val=&quot;{}&quot;/&gt;&lt;/InstanceID&gt;&lt;/Event&gt;</LastChange></e:property></e:propertyset>"#,
            state
        )
    }

    fn payload(sid: &str, seq: u32, body: String) -> NotificationPayload {
        NotificationPayload {
            subscription_id: sid.to_string(),
            seq,
            path: "/RINCON_AAA/AVTransport".to_string(),
            event_xml: body,
        }
    }

    fn processor() -> (EventProcessor, SidTable, mpsc::Receiver<ServiceEvent>) {
        let sids = SidTable::default();
        sids.insert(SID.to_string(), ServiceRef::new("RINCON_AAA", AVT));
        let (tx, rx) = mpsc::channel(16);
        (EventProcessor::new(sids.clone(), tx), sids, rx)
    }

    #[tokio::test]
    async fn test_known_sid_is_forwarded() {
        let (processor, _sids, mut rx) = processor();

        processor
            .process_notification(payload(SID, 1, avt_event("PLAYING")))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.service, ServiceRef::new("RINCON_AAA", AVT));
        assert_eq!(event.sequence, EventSequence::new(SID, 1));
        assert_eq!(event.properties.get("TransportState"), Some("PLAYING"));
        assert_eq!(processor.stats().events_processed, 1);
    }

    #[tokio::test]
    async fn test_sequence_is_taken_from_the_payload() {
        let (processor, _sids, mut rx) = processor();

        processor
            .process_notification(payload(SID, u32::MAX, avt_event("PLAYING")))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().sequence, EventSequence::new(SID, u32::MAX));
    }

    #[tokio::test]
    async fn test_unknown_sid_is_dropped() {
        let (processor, sids, mut rx) = processor();
        sids.remove(SID);

        let result = processor
            .process_notification(payload(SID, 2, avt_event("STOPPED")))
            .await;

        assert!(matches!(result, Err(EventProcessingError::UnknownSubscription(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(processor.stats().unknown_subscriptions, 1);
    }

    #[tokio::test]
    async fn test_malformed_body_is_dropped() {
        let (processor, _sids, mut rx) = processor();

        let result = processor
            .process_notification(payload(SID, 3, "<propertyset><broken".to_string()))
            .await;

        assert!(matches!(result, Err(EventProcessingError::Parsing(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(processor.stats().parse_errors, 1);
    }

    #[tokio::test]
    async fn test_run_preserves_arrival_order() {
        let (processor, _sids, mut rx) = processor();
        let (tx, notifications) = mpsc::unbounded_channel();

        tx.send(payload(SID, 1, avt_event("PLAYING"))).unwrap();
        tx.send(payload("uuid:unknown", 0, avt_event("PAUSED_PLAYBACK"))).unwrap();
        tx.send(payload(SID, 0, avt_event("STOPPED"))).unwrap();
        drop(tx);

        processor.clone().run(notifications).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence.seq, 1);
        assert_eq!(second.sequence.seq, 0);
        assert_eq!(second.properties.get("TransportState"), Some("STOPPED"));
        assert_eq!(
            processor.stats(),
            EventProcessorStats {
                events_received: 3,
                events_processed: 2,
                unknown_subscriptions: 1,
                parse_errors: 0,
            }
        );
    }
}
