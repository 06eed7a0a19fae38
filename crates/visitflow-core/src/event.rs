use std::sync::Arc;

use tracing::warn;

use crate::traits::EventRecorder;
use crate::types::LifecycleEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all lifecycle events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Records lifecycle events durably, then fans them out on the bus.
///
/// A recorder failure is logged and never interrupts traversal.
pub struct EventJournal {
    recorder: Arc<dyn EventRecorder>,
    bus: Arc<EventBus>,
}

impl EventJournal {
    pub fn new(recorder: Arc<dyn EventRecorder>, bus: Arc<EventBus>) -> Self {
        Self { recorder, bus }
    }

    pub async fn append(&self, event: LifecycleEvent) {
        if let Err(e) = self.recorder.record(event.clone()).await {
            warn!(
                run_id = %event.run_id,
                event = %event.kind,
                error = %e,
                "Failed to record lifecycle event"
            );
        }
        self.bus.publish(event);
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn recorder(&self) -> &Arc<dyn EventRecorder> {
        &self.recorder
    }
}
