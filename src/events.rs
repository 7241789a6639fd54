//! Transfer notifications
//!
//! Advisory events published by the selector and the peer manager. Delivery
//! goes through a broadcast channel so publishing never waits on subscribers.

use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::trace;

/// Something observable happened in the transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// The listener is bound and accepting
    Listening(SocketAddr),
    /// The peer registry or a peer's handshake state changed
    PeersChanged,
    /// Our handshake reached the given peer
    HandshakeSent(SocketAddr),
    /// A valid handshake arrived from the given peer
    HandshakeReceived(SocketAddr),
    /// Every block of the piece has been received
    PieceComplete(u32),
    /// A peer connection failed, or the supervisory task failed and is terminating
    ConnectionException(String),
    /// Shutdown has begun
    Stopping,
}

/// Cloneable publishing handle
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TransferEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.sender.subscribe()
    }

    /// Publish without waiting; having no subscribers is fine
    pub fn publish(&self, event: TransferEvent) {
        trace!("Publishing event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(TransferEvent::PeersChanged);
    }

    #[test]
    fn test_subscriber_receives_in_order() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(TransferEvent::PieceComplete(1));
        bus.publish(TransferEvent::Stopping);
        assert_eq!(rx.try_recv().unwrap(), TransferEvent::PieceComplete(1));
        assert_eq!(rx.try_recv().unwrap(), TransferEvent::Stopping);
        assert!(rx.try_recv().is_err());
    }
}
