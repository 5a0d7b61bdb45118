//! Backpressure Gate.
//!
//! A sender asks the gate before every chunk. Below the high watermark the
//! answer is immediate; above it the gate parks on the link's drain signal
//! (armed at the low watermark) until the queue empties out. This keeps the
//! pipe full without ever queueing much more than the high watermark.

use tracing::debug;

use super::manager::{ConnectionManager, LinkHandle};
use crate::core::config::{BUFFER_HIGH_WATERMARK, BUFFER_LOW_WATERMARK};
use crate::core::error::{CoreError, CoreResult};

#[derive(Clone)]
pub struct BackpressureGate {
    manager: ConnectionManager,
    high: usize,
    low: usize,
}

impl BackpressureGate {
    pub fn new(manager: ConnectionManager) -> Self {
        Self::with_watermarks(manager, BUFFER_HIGH_WATERMARK, BUFFER_LOW_WATERMARK)
    }

    pub fn with_watermarks(manager: ConnectionManager, high: usize, low: usize) -> Self {
        Self {
            manager,
            high,
            low: low.min(high),
        }
    }

    /// Resolve once the link to `peer_id` can take more data.
    ///
    /// Fails with [`CoreError::LinkClosed`] when the link is missing or goes
    /// away while waiting.
    pub async fn wait_for_capacity(&self, peer_id: &str) -> CoreResult<()> {
        let Some(handle) = self.manager.link_handle(peer_id) else {
            return Err(CoreError::LinkClosed {
                peer_id: peer_id.to_string(),
            });
        };
        if self.wait_on(&handle).await {
            Ok(())
        } else {
            Err(CoreError::LinkClosed {
                peer_id: peer_id.to_string(),
            })
        }
    }

    /// Returns false if the link closed.
    async fn wait_on(&self, handle: &LinkHandle) -> bool {
        let link = &handle.link;
        loop {
            if handle.closed.cancelled() || !link.is_open() {
                return false;
            }
            let buffered = link.buffered_amount().await;
            if buffered < self.high {
                return true;
            }

            link.set_buffered_amount_low_threshold(self.low).await;
            let drain = link.drain_signal();
            let notified = drain.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // The queue may have drained while the subscription was installed.
            if link.buffered_amount().await <= self.low {
                return true;
            }

            debug!(
                event = "backpressure_wait",
                peer = link.peer_id(),
                buffered,
                high = self.high,
                low = self.low,
                "Waiting for send queue to drain"
            );
            tokio::select! {
                _ = &mut notified => {}
                _ = handle.closed.wait() => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::ConnectionEvent;
    use crate::core::connection::memory::MemoryNetwork;
    use crate::core::protocol::ProtocolMessage;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    async fn linked(net: &MemoryNetwork) -> (ConnectionManager, ConnectionManager) {
        let a = ConnectionManager::new(Arc::new(net.clone()), 5);
        let b = ConnectionManager::new(Arc::new(net.clone()), 5);
        a.initialize("ALICE1").await.unwrap();
        b.initialize("BRUCE2").await.unwrap();
        let mut rx = a.subscribe();
        a.connect("BRUCE2").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(event) = rx.recv().await {
                if matches!(event, ConnectionEvent::Connected { .. }) {
                    break;
                }
            }
        })
        .await
        .unwrap();
        (a, b)
    }

    fn chunk(len: usize) -> ProtocolMessage {
        ProtocolMessage::Chunk {
            transfer_id: Uuid::new_v4(),
            data: Bytes::from(vec![7u8; len]),
        }
    }

    #[tokio::test]
    async fn resolves_immediately_below_high_watermark() {
        let net = MemoryNetwork::new();
        let (a, _b) = linked(&net).await;
        let gate = BackpressureGate::new(a);
        tokio::time::timeout(Duration::from_millis(100), gate.wait_for_capacity("BRUCE2"))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn missing_link_is_closed() {
        let net = MemoryNetwork::new();
        let (a, _b) = linked(&net).await;
        let gate = BackpressureGate::new(a);
        let err = gate.wait_for_capacity("DELTA4").await.unwrap_err();
        assert!(matches!(err, CoreError::LinkClosed { .. }));
    }

    #[tokio::test]
    async fn waits_until_queue_drains() {
        let net = MemoryNetwork::new();
        let (a, _b) = linked(&net).await;
        let pipe = net.pipe("ALICE1", "BRUCE2").unwrap();
        pipe.pause();
        a.send("BRUCE2", &chunk(60)).await.unwrap();
        a.send("BRUCE2", &chunk(60)).await.unwrap();
        assert!(pipe.buffered() >= 100);

        let gate = BackpressureGate::with_watermarks(a, 100, 50);
        let waiter = tokio::spawn(async move { gate.wait_for_capacity("BRUCE2").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pipe.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(pipe.buffered() < 100);
    }

    #[tokio::test]
    async fn link_closing_while_waiting_fails() {
        let net = MemoryNetwork::new();
        let (a, _b) = linked(&net).await;
        let pipe = net.pipe("ALICE1", "BRUCE2").unwrap();
        pipe.pause();
        a.send("BRUCE2", &chunk(200)).await.unwrap();

        let gate = BackpressureGate::with_watermarks(a, 100, 50);
        let waiter = tokio::spawn(async move { gate.wait_for_capacity("BRUCE2").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipe.sever();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CoreError::LinkClosed { .. })));
    }
}
