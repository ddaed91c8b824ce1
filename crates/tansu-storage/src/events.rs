//! Storage event bus.
//!
//! A broadcast channel carrying media lifecycle and handle-close events.
//! Publishing never blocks and never fails; events sent with no subscriber
//! are simply dropped.

use tokio::sync::broadcast;

/// Events published by the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEvent {
    /// A card mount cycle ended in a present state.
    CardMounted,
    /// A card mount cycle exhausted its retries without usable state.
    CardMountError,
    /// The card was removed or explicitly unmounted.
    CardUnmounted,
    /// A file handle was closed.
    FileClosed,
    /// A directory handle was closed.
    DirClosed,
}

/// Cloneable publish/subscribe handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StorageEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast an event to current subscribers.
    pub fn publish(&self, event: StorageEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(16)
    }
}
