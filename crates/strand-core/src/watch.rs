//! Run event fan-out.
//!
//! A single broadcast channel carries every `RunEvent` the scheduler emits.
//! `EventBus` is cheap to clone (all clones share the sender); `RunWatcher`
//! is a per-run view that filters the stream down to one run id. Publishing
//! never blocks and never fails: with no subscribers the event is dropped,
//! and a slow watcher that lags simply skips ahead.

use strand_types::event::RunEvent;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Shared broadcast channel for run events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: RunEvent) {
        trace!(run_id = %event.run_id(), event = ?event, "publishing run event");
        // A send error only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    /// Subscribe to the full event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events for a single run.
    pub fn watch(&self, run_id: Uuid) -> RunWatcher {
        RunWatcher {
            run_id,
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// RunWatcher
// ---------------------------------------------------------------------------

/// Filtered event stream for one run.
pub struct RunWatcher {
    run_id: Uuid,
    receiver: broadcast::Receiver<RunEvent>,
}

impl RunWatcher {
    /// Next event for the watched run.
    ///
    /// Skips events for other runs and any gap caused by lagging behind the
    /// channel. Returns `None` once the bus is dropped.
    pub async fn next(&mut self) -> Option<RunEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.run_id() == self.run_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(run_id = %self.run_id, skipped, "watcher lagged, skipping ahead");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}
