//! Chunk distributor: publisher-side fan-out to subscriber queues.
//!
//! The subscriber list is a bounded array with tombstones (`None`), never
//! reallocated after init. Membership changes take the list mutex; the
//! delivery path snapshots the list under the mutex and pushes with the
//! lock released, so the daemon adding or removing a subscriber never
//! blocks behind a slow queue.

use super::UniquePortId;
use crate::config::MAX_SUBSCRIBERS_PER_PUBLISHER;
use crate::error::{Error, Result};
use crate::memory::SharedChunk;
use crate::queue::ChunkQueuePusher;
use std::sync::Mutex;

/// One attached subscriber queue.
#[derive(Clone)]
pub struct QueueEntry {
    /// Producer half of the subscriber's queue.
    pub pusher: ChunkQueuePusher,
    /// The subscriber port this queue belongs to.
    pub subscriber_id: UniquePortId,
    /// How many historical samples the subscriber asked for on connect.
    pub requested_history: usize,
}

/// Fan-out from one publisher to up to
/// [`MAX_SUBSCRIBERS_PER_PUBLISHER`] subscriber queues.
pub struct ChunkDistributor {
    entries: Mutex<[Option<QueueEntry>; MAX_SUBSCRIBERS_PER_PUBLISHER]>,
}

impl ChunkDistributor {
    /// Create a distributor with no attached queues.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    /// Attach a subscriber queue. Idempotent per subscriber id.
    ///
    /// Fails with [`Error::ResourceExhausted`] when the list is full.
    pub fn add_queue(&self, entry: QueueEntry) -> Result<()> {
        let mut entries = self.entries.lock().expect("subscriber list poisoned");

        if entries
            .iter()
            .flatten()
            .any(|e| e.subscriber_id == entry.subscriber_id)
        {
            return Ok(());
        }

        match entries.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                tracing::debug!(subscriber = %entry.subscriber_id, "subscriber queue attached");
                *slot = Some(entry);
                Ok(())
            }
            None => Err(Error::ResourceExhausted(format!(
                "subscriber list full ({} entries)",
                MAX_SUBSCRIBERS_PER_PUBLISHER
            ))),
        }
    }

    /// Detach a subscriber queue, leaving a tombstone. Returns true if the
    /// subscriber was attached.
    pub fn remove_queue(&self, subscriber_id: UniquePortId) -> bool {
        let mut entries = self.entries.lock().expect("subscriber list poisoned");
        for slot in entries.iter_mut() {
            if slot
                .as_ref()
                .is_some_and(|e| e.subscriber_id == subscriber_id)
            {
                *slot = None;
                tracing::debug!(subscriber = %subscriber_id, "subscriber queue detached");
                return true;
            }
        }
        false
    }

    /// Number of attached queues.
    pub fn queue_count(&self) -> usize {
        self.entries
            .lock()
            .expect("subscriber list poisoned")
            .iter()
            .flatten()
            .count()
    }

    /// Deliver one chunk to every attached queue.
    ///
    /// Each queue gets its own refcount contribution. A saturating queue
    /// that is full records the loss on its missed counter; the failure
    /// never propagates to the publisher. Returns the number of queues the
    /// chunk was actually placed into.
    pub fn deliver_to_all(&self, chunk: &SharedChunk) -> usize {
        let snapshot: Vec<QueueEntry> = {
            let entries = self.entries.lock().expect("subscriber list poisoned");
            entries.iter().flatten().cloned().collect()
        };

        let mut delivered = 0;
        for entry in &snapshot {
            match entry.pusher.push(chunk.clone()) {
                Ok(()) => delivered += 1,
                Err(Error::QueueOverflow) => {
                    tracing::debug!(
                        subscriber = %entry.subscriber_id,
                        "subscriber queue full, sample recorded as missed"
                    );
                }
                Err(e) => {
                    tracing::warn!(subscriber = %entry.subscriber_id, error = %e, "delivery failed");
                }
            }
        }
        delivered
    }

    /// Replay history into a newly connected queue: the last
    /// `min(history.len(), entry.requested_history)` samples, oldest
    /// first.
    pub fn deliver_historical(&self, entry: &QueueEntry, history: &[SharedChunk]) {
        let count = history.len().min(entry.requested_history);
        for chunk in &history[history.len() - count..] {
            if entry.pusher.push(chunk.clone()).is_err() {
                tracing::debug!(
                    subscriber = %entry.subscriber_id,
                    "queue full during history replay"
                );
            }
        }
    }
}

impl Default for ChunkDistributor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, RuntimeConfig};
    use crate::memory::MemoryManager;
    use crate::queue::{ChunkQueueData, ChunkQueueKind};
    use std::sync::Arc;

    fn manager() -> MemoryManager {
        let config = RuntimeConfig::new("dist-test", vec![PoolConfig::new(128, 64)]);
        MemoryManager::create(&config).unwrap()
    }

    fn entry(id: u64, capacity: usize) -> (Arc<ChunkQueueData>, QueueEntry) {
        let queue = Arc::new(ChunkQueueData::new(ChunkQueueKind::Fifo, capacity).unwrap());
        let entry = QueueEntry {
            pusher: ChunkQueuePusher::new(Arc::clone(&queue)),
            subscriber_id: UniquePortId(id),
            requested_history: 0,
        };
        (queue, entry)
    }

    #[test]
    fn test_add_remove_queue() {
        let distributor = ChunkDistributor::new();
        let (_q, e) = entry(1, 4);

        distributor.add_queue(e.clone()).unwrap();
        assert_eq!(distributor.queue_count(), 1);

        // Idempotent for the same subscriber.
        distributor.add_queue(e).unwrap();
        assert_eq!(distributor.queue_count(), 1);

        assert!(distributor.remove_queue(UniquePortId(1)));
        assert!(!distributor.remove_queue(UniquePortId(1)));
        assert_eq!(distributor.queue_count(), 0);
    }

    #[test]
    fn test_list_capacity_bounded() {
        let distributor = ChunkDistributor::new();
        let mut queues = Vec::new();
        for i in 0..MAX_SUBSCRIBERS_PER_PUBLISHER as u64 {
            let (q, e) = entry(i + 1, 4);
            queues.push(q);
            distributor.add_queue(e).unwrap();
        }
        let (_q, overflow) = entry(999, 4);
        assert!(matches!(
            distributor.add_queue(overflow),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_tombstone_slot_reused() {
        let distributor = ChunkDistributor::new();
        let mut queues = Vec::new();
        for i in 0..MAX_SUBSCRIBERS_PER_PUBLISHER as u64 {
            let (q, e) = entry(i + 1, 4);
            queues.push(q);
            distributor.add_queue(e).unwrap();
        }
        distributor.remove_queue(UniquePortId(3));

        let (_q, replacement) = entry(100, 4);
        distributor.add_queue(replacement).unwrap();
        assert_eq!(distributor.queue_count(), MAX_SUBSCRIBERS_PER_PUBLISHER);
    }

    #[test]
    fn test_deliver_to_all_refcounts() {
        let manager = manager();
        let distributor = ChunkDistributor::new();
        let (q1, e1) = entry(1, 4);
        let (q2, e2) = entry(2, 4);
        let (q3, e3) = entry(3, 4);
        distributor.add_queue(e1).unwrap();
        distributor.add_queue(e2).unwrap();
        distributor.add_queue(e3).unwrap();

        let chunk = manager.get_chunk(16, 8).unwrap();
        assert_eq!(distributor.deliver_to_all(&chunk), 3);

        // Publisher handle + one contribution per queue.
        assert_eq!(chunk.refcount(), 4);

        for queue in [&q1, &q2, &q3] {
            let received = queue.pop().unwrap();
            assert!(received.ptr_eq(&chunk));
        }
        assert_eq!(chunk.refcount(), 1);
        drop(chunk);
        assert_eq!(manager.total_in_use(), 0);
    }

    #[test]
    fn test_full_queue_does_not_fail_delivery() {
        let manager = manager();
        let distributor = ChunkDistributor::new();
        let (q1, e1) = entry(1, 1);
        distributor.add_queue(e1).unwrap();

        let first = manager.get_chunk(16, 8).unwrap();
        let second = manager.get_chunk(16, 8).unwrap();
        assert_eq!(distributor.deliver_to_all(&first), 1);
        // Queue full: delivery "succeeds" from the publisher's view.
        assert_eq!(distributor.deliver_to_all(&second), 0);
        assert_eq!(q1.take_missed(), 1);

        drop(first);
        drop(second);
        q1.clear();
        assert_eq!(manager.total_in_use(), 0);
    }

    #[test]
    fn test_deliver_historical_respects_request() {
        let manager = manager();
        let distributor = ChunkDistributor::new();

        let history: Vec<SharedChunk> = (0..4u32)
            .map(|i| {
                let mut chunk = manager.get_chunk(4, 4).unwrap();
                chunk
                    .payload_mut()
                    .unwrap()
                    .copy_from_slice(&i.to_le_bytes());
                chunk
            })
            .collect();

        let (queue, mut e) = entry(1, 8);
        e.requested_history = 2;
        distributor.deliver_historical(&e, &history);

        // The last two samples, oldest first.
        let a = queue.pop().unwrap();
        let b = queue.pop().unwrap();
        assert_eq!(a.payload().unwrap(), &2u32.to_le_bytes());
        assert_eq!(b.payload().unwrap(), &3u32.to_le_bytes());
        assert!(queue.pop().is_none());
    }
}
