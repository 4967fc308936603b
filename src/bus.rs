/// Broadcast bus for order lifecycle events

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::ExecutionEvent;

/// Fan-out channel the execution coordinator publishes fills and state
/// changes on. Subscribers that lag simply miss events; the tracker does
/// not rely on replay because equity is recomputed every cycle.
#[derive(Debug, Clone)]
pub struct ExecutionBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl ExecutionBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4096);
        debug!("ExecutionBus initialized with capacity: 4096");
        Self { tx }
    }

    pub fn publish(&self, event: ExecutionEvent) {
        // Send only fails when there are no subscribers, which is fine
        // during startup and teardown.
        if let Err(e) = self.tx.send(event) {
            debug!(error = %e, "No subscribers for execution event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        let receiver = self.tx.subscribe();
        debug!("New subscriber added to execution bus");
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        let count = self.tx.receiver_count();
        if count == 0 {
            warn!("Execution bus has no subscribers");
        }
        count
    }
}

impl Default for ExecutionBus {
    fn default() -> Self {
        Self::new()
    }
}
