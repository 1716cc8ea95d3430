//! Background event worker
//!
//! Consumes parsed notifications from the event broker and applies them to
//! the [`DeviceRegistry`] in arrival order.

use std::sync::Arc;

use sonos_stream::ServiceEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::registry::{DeviceRegistry, UpdateOutcome};

/// Spawns the state event worker task
///
/// The task ends when the sending side of `events` is dropped.
pub fn spawn_state_event_worker(
    registry: Arc<DeviceRegistry>,
    mut events: mpsc::Receiver<ServiceEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("State event worker started, waiting for events...");

        while let Some(event) = events.recv().await {
            tracing::debug!(
                service = %event.service,
                sid = %event.sequence.subscription_id,
                seq = event.sequence.seq,
                properties = event.properties.len(),
                "applying event"
            );

            let outcomes = registry.apply_event(&event);
            let stale = outcomes
                .iter()
                .filter(|outcome| **outcome == UpdateOutcome::Stale)
                .count();
            if stale > 0 {
                tracing::debug!(service = %event.service, stale, "dropped stale properties");
            }
            if outcomes.contains(&UpdateOutcome::UnknownService) {
                tracing::warn!(service = %event.service, "event for a device not in the registry");
            }
        }

        tracing::info!("State event worker stopped");
    })
}
