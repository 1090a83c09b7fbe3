//! In-process publish/subscribe fabric.
//!
//! Delivery is in-order per publisher and best-effort across publishers.
//! Each subscriber has a bounded queue; when it overflows the oldest events
//! are dropped and the subscriber sees a `SubscriberLagged` marker instead,
//! so a stalled observer never blocks a publisher. Nothing is persisted.

use tokio::sync::broadcast;

use crate::event::BusEvent;

/// Default per-subscriber queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Handle for publishing and subscribing to dialogue events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(queue_depth: usize) -> Self {
        let (tx, _) = broadcast::channel(queue_depth.max(1));
        Self { tx }
    }

    /// Publish an event. Succeeds even with no subscribers.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> BusSubscriber {
        BusSubscriber {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscribers, for diagnostics.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

/// Receiving end of the bus.
pub struct BusSubscriber {
    rx: broadcast::Receiver<BusEvent>,
}

impl BusSubscriber {
    /// Receive the next event.
    ///
    /// Returns `None` once every publisher handle is dropped. A lagging
    /// subscriber receives `BusEvent::SubscriberLagged` in place of the
    /// dropped events and then continues from the oldest retained event.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "bus subscriber lagged, dropped oldest events");
                Some(BusEvent::SubscriberLagged { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Drain whatever is immediately available without waiting.
    pub fn drain(&mut self) -> Vec<BusEvent> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    out.push(BusEvent::SubscriberLagged { missed });
                }
                Err(_) => break,
            }
        }
        out
    }
}
