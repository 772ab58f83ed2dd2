use tokio::sync::broadcast;
use tracing::warn;

use crate::errors::LockError;
use crate::stats::ServerId;

/// One observable failure seen by a Server Adapter, broadcast for diagnostics.
#[derive(Debug, Clone)]
pub struct LockEvent {
    pub server: ServerId,
    pub error: LockError,
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Multi-subscriber broadcast of adapter-level errors.
///
/// A default no-op subscriber is always attached (see [`EventBus::new`]) so that an
/// unobserved error never backs up the channel or panics a lagging receiver into
/// crashing the host.
pub struct EventBus {
    sender: broadcast::Sender<LockEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, receiver) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        spawn_default_subscriber(receiver);
        EventBus { sender }
    }

    pub fn publish(&self, event: LockEvent) {
        // No subscribers is not an error: the default drain task above always holds
        // one receiver open, but sends can still race a full channel under load.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_default_subscriber(mut receiver: broadcast::Receiver<LockEvent>) {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    warn!(server = %event.server.addr, error = %event.error, "redlock adapter error");
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
