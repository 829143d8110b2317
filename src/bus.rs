// =============================================================================
// Fan-out bus — non-blocking publish with per-subscriber backlog
// =============================================================================
//
// Each subscriber owns a bounded channel plus an overflow queue. Publishing
// first drains the queue into the channel without blocking, then attempts to
// deliver the new item; if the channel is still full the item lands in the
// queue. Per subscriber, delivery order always matches publish order. The
// publisher never suspends.
//
// Backlogs are bounded; on overflow the oldest queued item is dropped, so a
// dead-slow subscriber degrades to a sparse (but still ordered) view of the
// stream while everyone else sees all of it.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::warn;

/// Default cap on a subscriber's overflow queue. Large enough to absorb the
/// full warm-up buffering window on the trade feed.
pub const DEFAULT_MAX_BACKLOG: usize = 65_536;

struct SubscriberSlot<T> {
    tx: mpsc::Sender<T>,
    backlog: Mutex<VecDeque<T>>,
}

pub struct FanoutBus<T> {
    name: String,
    subscribers: RwLock<HashMap<u64, SubscriberSlot<T>>>,
    next_id: AtomicU64,
    channel_capacity: usize,
    max_backlog: usize,
}

impl<T: Clone> FanoutBus<T> {
    /// Create a bus whose subscriber channels hold `channel_capacity` items
    /// before overflowing into the backlog queue.
    pub fn new(name: impl Into<String>, channel_capacity: usize) -> Self {
        Self {
            name: name.into(),
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            channel_capacity: channel_capacity.max(1),
            max_backlog: DEFAULT_MAX_BACKLOG,
        }
    }

    pub fn with_max_backlog(mut self, max_backlog: usize) -> Self {
        self.max_backlog = max_backlog.max(1);
        self
    }

    /// Register a new subscriber and return its id plus the receive half.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(
            id,
            SubscriberSlot {
                tx,
                backlog: Mutex::new(VecDeque::new()),
            },
        );
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver `item` to every subscriber without ever blocking.
    ///
    /// The read lock is held for the duration of the publish; each
    /// channel/queue pair has exactly one publisher, so mutating the backlog
    /// under the read lock is safe.
    pub fn publish(&self, item: T) {
        let subscribers = self.subscribers.read();
        for slot in subscribers.values() {
            if slot.tx.is_closed() {
                // Receiver gone; unsubscribe will clean the slot up.
                slot.backlog.lock().clear();
                continue;
            }
            let mut backlog = slot.backlog.lock();

            // Drain queued items first to preserve per-subscriber order.
            let mut drained = true;
            while let Some(next) = backlog.front() {
                match slot.tx.try_send(next.clone()) {
                    Ok(()) => {
                        backlog.pop_front();
                    }
                    Err(_) => {
                        drained = false;
                        break;
                    }
                }
            }

            if drained {
                match slot.tx.try_send(item.clone()) {
                    Ok(()) => continue,
                    Err(mpsc::error::TrySendError::Full(returned)) => {
                        backlog.push_back(returned);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => continue,
                }
            } else {
                backlog.push_back(item.clone());
            }

            if backlog.len() > self.max_backlog {
                backlog.pop_front();
                warn!(bus = %self.name, "subscriber backlog overflow, dropping oldest");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus: FanoutBus<u32> = FanoutBus::new("test", 4);
        let (_id, mut rx) = bus.subscribe();

        for i in 0..100 {
            bus.publish(i);
            // Interleave consumption so the channel never stays full.
            if i % 3 == 0 {
                while let Ok(v) = rx.try_recv() {
                    let _ = v;
                }
            }
        }

        // Re-publish a final marker and drain everything.
        bus.publish(1000);
        let mut seen = Vec::new();
        while let Ok(v) = rx.try_recv() {
            seen.push(v);
        }
        for pair in seen.windows(2) {
            assert!(pair[0] < pair[1], "out of order: {:?}", seen);
        }
    }

    #[tokio::test]
    async fn backlog_preserves_overflow_items() {
        let bus: FanoutBus<u32> = FanoutBus::new("test", 1);
        let (_id, mut rx) = bus.subscribe();

        bus.publish(1);
        bus.publish(2); // channel full, queued
        bus.publish(3); // queued

        assert_eq!(rx.recv().await, Some(1));
        // The queued items flush on the next publish.
        bus.publish(4);
        assert_eq!(rx.recv().await, Some(2));
        bus.publish(5);
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn slow_subscriber_never_blocks_publisher_or_peers() {
        let bus: FanoutBus<u32> = FanoutBus::new("test", 1).with_max_backlog(8);
        let (_slow_id, _slow_rx) = bus.subscribe();
        let (_fast_id, mut fast_rx) = bus.subscribe();

        // Far more messages than the slow subscriber can hold. The publisher
        // must complete regardless.
        for i in 0..1000 {
            bus.publish(i);
            if let Ok(v) = fast_rx.try_recv() {
                let _ = v;
            }
        }
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn delivered_sequence_is_ordered_subsequence_under_drops() {
        let bus: FanoutBus<u32> = FanoutBus::new("test", 1).with_max_backlog(4);
        let (_id, mut rx) = bus.subscribe();

        for i in 0..64 {
            bus.publish(i);
        }
        let mut seen = Vec::new();
        while let Ok(v) = rx.try_recv() {
            seen.push(v);
        }
        // Whatever survived must be strictly increasing (order-preserving
        // subsequence of the published sequence).
        for pair in seen.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[tokio::test]
    async fn unsubscribe_removes_slot() {
        let bus: FanoutBus<u32> = FanoutBus::new("test", 1);
        let (id, _rx) = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(1);
    }
}
