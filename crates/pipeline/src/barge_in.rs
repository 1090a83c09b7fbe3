//! Barge-in coordinator.
//!
//! Watches for interrupt requests on the bus (the machine emits one when the
//! user speaks over agent playback, and the control channel can inject one
//! explicitly). On interrupt: fire the active reply's cancel token, tell the
//! playback transport to drop buffered-but-unplayed audio, and acknowledge.

use std::sync::Arc;

use lumina_core::{BusEvent, CancelToken, EventBus, PlaybackSink};

use crate::orchestrator::ReplySlot;

pub struct BargeInCoordinator {
    bus: EventBus,
    slot: ReplySlot,
    playback: Arc<dyn PlaybackSink>,
}

impl BargeInCoordinator {
    pub fn new(bus: EventBus, slot: ReplySlot, playback: Arc<dyn PlaybackSink>) -> Self {
        Self {
            bus,
            slot,
            playback,
        }
    }

    pub async fn run(self, shutdown: CancelToken) {
        let mut sub = self.bus.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = sub.recv() => match event {
                    Some(BusEvent::InterruptRequested) => self.handle_interrupt().await,
                    Some(_) => {}
                    None => break,
                },
            }
        }
        tracing::debug!("barge-in coordinator stopped");
    }

    async fn handle_interrupt(&self) {
        match self.slot.cancel_active() {
            Some(task_id) => {
                tracing::info!(task_id = %task_id, "barge-in: cancelled active reply");
            }
            None => {
                tracing::debug!("barge-in with no active reply");
            }
        }

        if let Err(e) = self.playback.drop_buffered().await {
            tracing::warn!(error = %e, "failed to drop buffered playback audio");
        }

        self.bus.publish(BusEvent::InterruptAcknowledged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::RecordingPlayback;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interrupt_drops_buffered_and_acknowledges() {
        let bus = EventBus::new(64);
        let slot = ReplySlot::new();
        let playback = Arc::new(RecordingPlayback::new());

        let coordinator =
            BargeInCoordinator::new(bus.clone(), slot.clone(), playback.clone());
        let shutdown = CancelToken::new();
        let handle = tokio::spawn(coordinator.run(shutdown.clone()));

        let mut sub = bus.subscribe();
        bus.publish(BusEvent::InterruptRequested);

        // The acknowledgement follows the interrupt on the bus.
        let ack = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match sub.recv().await {
                    Some(BusEvent::InterruptAcknowledged) => break true,
                    Some(_) => continue,
                    None => break false,
                }
            }
        })
        .await
        .unwrap();

        assert!(ack);
        assert_eq!(playback.drops(), 1);

        shutdown.cancel();
        let _ = handle.await;
    }
}
