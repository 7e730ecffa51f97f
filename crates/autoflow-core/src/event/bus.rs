//! Execution event fan-out.
//!
//! The orchestrator, retry controller and fallback coordinator all publish
//! into one `tokio::sync::broadcast` channel; SSE clients and tests
//! subscribe. Nobody listening is normal, so publishing never fails.

use autoflow_types::event::ExecutionEvent;
use tokio::sync::broadcast;

/// Cheap-to-clone handle on the execution event channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    /// A zero capacity is bumped to one; broadcast channels reject zero.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ExecutionEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            tracing::trace!(execution_id = %event.execution_id(), "no event subscribers");
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.receiver_count())
            .finish()
    }
}
