//! The chain engine's event sink: a bounded channel consumers poll instead
//! of a callback-driven observer.

use tokio::sync::mpsc;

use crate::block::Block;
use crate::transaction::PendingTransaction;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ChainEvent {
    LatestBlock(Block),
    Blocks(Vec<Block>),
    Mempool(Vec<PendingTransaction>),
}

/// Sending half, held by the chain engine.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ChainEvent>,
}

impl EventSink {
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<ChainEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Publishes an event; drops it on a full channel rather than blocking
    /// the chain lock on a slow consumer.
    pub fn publish(&self, event: ChainEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::warn!("event channel full, dropping chain event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_events_are_received_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.publish(ChainEvent::Mempool(vec![]));
        sink.publish(ChainEvent::Blocks(vec![]));

        assert!(matches!(rx.recv().await, Some(ChainEvent::Mempool(_))));
        assert!(matches!(rx.recv().await, Some(ChainEvent::Blocks(_))));
    }
}
