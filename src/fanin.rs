//! Fan-in aggregator.
//!
//! Merges the events of every poller in a session into one bounded queue with
//! a single consumer. Producers wait when the queue is full; nothing is dropped.
//! Each producer's own order is preserved, interleaving across producers is not
//! specified.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityEvent;

/// The consumer side is gone; the event is handed back.
#[derive(Debug, Error)]
#[error("fan-in queue closed")]
pub struct QueueClosed(pub ActivityEvent);

/// Create a bounded fan-in queue.
///
/// A capacity of zero is raised to one.
#[must_use]
pub fn bounded(capacity: usize) -> (FanInSender, FanInReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (FanInSender { tx }, FanInReceiver { rx, capacity })
}

/// Producer handle, cloned once per poller.
#[derive(Debug, Clone)]
pub struct FanInSender {
    tx: mpsc::Sender<ActivityEvent>,
}

impl FanInSender {
    /// Enqueue an event, waiting while the queue is full.
    pub async fn put(&self, event: ActivityEvent) -> Result<(), QueueClosed> {
        self.tx.send(event).await.map_err(|e| QueueClosed(e.0))
    }

    /// Returns true once the consumer has closed or dropped the queue.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer handle, owned by the session.
#[derive(Debug)]
pub struct FanInReceiver {
    rx: mpsc::Receiver<ActivityEvent>,
    capacity: usize,
}

impl FanInReceiver {
    /// Next event in dequeue order.
    ///
    /// Returns `None` when `cancel` fires or every producer is gone and the
    /// queue is drained.
    pub async fn get(&mut self, cancel: &CancellationToken) -> Option<ActivityEvent> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    /// Next event without waiting.
    pub fn try_get(&mut self) -> Option<ActivityEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting events; blocked producers are released with `QueueClosed`.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Events currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of buffered events.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::record::{MonotonicSeq, SourceKind, SourceRecord};
    use crate::transform::transform;

    fn event(seq: u64) -> ActivityEvent {
        let record = SourceRecord::bookmark("u", "f").with_seq(MonotonicSeq::new(seq));
        transform(SourceKind::Bookmark, &record).unwrap()
    }

    #[tokio::test]
    async fn preserves_producer_order() {
        let (tx, mut rx) = bounded(8);
        for s in 1..=5 {
            tx.put(event(s)).await.unwrap();
        }
        let cancel = CancellationToken::new();
        for s in 1..=5 {
            assert_eq!(rx.get(&cancel).await.unwrap().seq.get(), s);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_blocks_producer() {
        let (tx, mut rx) = bounded(1);
        tx.put(event(1)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.put(event(2))).await;
        assert!(blocked.is_err(), "second put should wait for capacity");

        let producer = tokio::spawn({
            let tx = tx.clone();
            async move { tx.put(event(2)).await }
        });
        let cancel = CancellationToken::new();
        assert_eq!(rx.get(&cancel).await.unwrap().seq.get(), 1);
        producer.await.unwrap().unwrap();
        assert_eq!(rx.get(&cancel).await.unwrap().seq.get(), 2);
    }

    #[tokio::test]
    async fn get_returns_none_on_cancel() {
        let (_tx, mut rx) = bounded(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(rx.get(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn close_releases_producers() {
        let (tx, mut rx) = bounded(1);
        tx.put(event(1)).await.unwrap();
        rx.close();
        let err = tx.put(event(2)).await.unwrap_err();
        assert_eq!(err.0.seq.get(), 2);
        assert!(tx.is_closed());
    }

    #[test]
    fn zero_capacity_is_raised() {
        let (_tx, rx) = bounded(0);
        assert_eq!(rx.capacity(), 1);
    }
}
