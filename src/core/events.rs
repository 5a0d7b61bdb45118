//! Observer list and the events the core publishes outward.
//!
//! [`EventBus`] hands each subscriber its own unbounded channel, so a slow
//! observer never causes another to miss events. Subscribers that dropped
//! their receiver are pruned on the next publish.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::error::ErrorKind;
use crate::core::protocol::{ChatMessage, PeerInfo};
use crate::core::transfer::TransferRecord;

pub struct EventBus<T: Clone> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T: Clone> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer. Events published before this call are not replayed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    pub fn publish(&self, event: T) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Events published by the transfer coordinator.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    ConnectionChanged {
        peer_id: String,
        open: bool,
    },
    PeerIdentified(PeerInfo),
    TransferStarted(TransferRecord),
    TransferProgress {
        transfer_id: Uuid,
        percent: u8,
    },
    /// Carries the final record, which the coordinator no longer tracks.
    TransferComplete {
        transfer_id: Uuid,
        record: TransferRecord,
    },
    TransferFailed {
        transfer_id: Uuid,
        reason: String,
        record: TransferRecord,
    },
    ProtocolError {
        kind: ErrorKind,
        detail: String,
    },
    ChatReceived {
        peer_id: String,
        message: ChatMessage,
    },
    PeerLeft {
        peer_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::<u32>::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(1);
        bus.publish(2);
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::<u32>::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(7);
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
    }
}
