//! Pipeline event bus.

use tokio::sync::broadcast;

use mangaforge_common::PipelineEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast fan-out for pipeline events. Emission never blocks and never
/// fails; events are dropped when nobody is listening.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(PipelineEvent::PhaseStarted {
            session_id: Uuid::nil(),
            phase: 1,
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, PipelineEvent::PhaseStarted { phase: 1, .. }));
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(PipelineEvent::SessionCompleted {
            session_id: Uuid::nil(),
        });
    }
}
