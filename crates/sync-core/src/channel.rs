use tokio::sync::broadcast;

use crate::types::EngineEvent;

/// Broadcast event stream type handed to engine observers.
pub type EventStream = broadcast::Receiver<EngineEvent>;

/// Engine event fan-out used by the supervisor and send coordinator.
#[derive(Clone, Debug)]
pub struct EngineEvents {
    event_tx: broadcast::Sender<EngineEvent>,
}

impl EngineEvents {
    /// Create a new event fan-out with the given buffer size.
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted engine events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}
