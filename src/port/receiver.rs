//! Chunk receiver: subscriber-side retrieval.

use crate::memory::SharedChunk;
use crate::queue::ChunkQueuePopper;

/// Drains a subscriber queue, one chunk at a time. The receiver keeps no
/// reference to a chunk after handing it out; the returned handle's
/// lifetime alone decides when the chunk returns to its pool.
pub struct ChunkReceiver {
    popper: ChunkQueuePopper,
}

impl ChunkReceiver {
    /// Wrap the consuming half of a subscriber queue.
    pub fn new(popper: ChunkQueuePopper) -> Self {
        Self { popper }
    }

    /// Take the oldest queued chunk, or `None` if the queue is empty.
    pub fn take(&self) -> Option<SharedChunk> {
        self.popper.pop()
    }

    /// Returns true if at least one chunk is queued.
    pub fn has_data(&self) -> bool {
        !self.popper.is_empty()
    }

    /// Returns true if samples were lost since the last call, clearing
    /// the missed flag.
    pub fn has_missed_data(&self) -> bool {
        self.popper.take_missed() > 0
    }

    /// Drain the queue, releasing every queued chunk.
    pub fn release_queued_data(&self) {
        self.popper.clear();
    }

    /// The underlying popper, for queue-level operations (wake semaphore,
    /// capacity changes).
    pub fn popper(&self) -> &ChunkQueuePopper {
        &self.popper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, RuntimeConfig};
    use crate::memory::MemoryManager;
    use crate::queue::{ChunkQueueData, ChunkQueueKind, ChunkQueuePusher};
    use std::sync::Arc;

    fn setup() -> (MemoryManager, ChunkQueuePusher, ChunkReceiver) {
        let config = RuntimeConfig::new("recv-test", vec![PoolConfig::new(128, 16)]);
        let manager = MemoryManager::create(&config).unwrap();
        let queue = Arc::new(ChunkQueueData::new(ChunkQueueKind::Fifo, 4).unwrap());
        let pusher = ChunkQueuePusher::new(Arc::clone(&queue));
        let receiver = ChunkReceiver::new(crate::queue::ChunkQueuePopper::new(queue));
        (manager, pusher, receiver)
    }

    #[test]
    fn test_take_empty() {
        let (_manager, _pusher, receiver) = setup();
        assert!(!receiver.has_data());
        assert!(receiver.take().is_none());
    }

    #[test]
    fn test_take_returns_pushed_chunk() {
        let (manager, pusher, receiver) = setup();
        let chunk = manager.get_chunk(16, 8).unwrap();
        pusher.push(chunk.clone()).unwrap();

        assert!(receiver.has_data());
        let taken = receiver.take().unwrap();
        assert!(taken.ptr_eq(&chunk));
        assert!(!receiver.has_data());
    }

    #[test]
    fn test_missed_flag_consumed() {
        let (manager, pusher, receiver) = setup();
        for _ in 0..5 {
            let _ = pusher.push(manager.get_chunk(16, 8).unwrap());
        }
        // Capacity 4: the fifth push was missed.
        assert!(receiver.has_missed_data());
        assert!(!receiver.has_missed_data());
        receiver.release_queued_data();
    }

    #[test]
    fn test_release_queued_data_returns_chunks_to_pool() {
        let (manager, pusher, receiver) = setup();
        for _ in 0..3 {
            pusher.push(manager.get_chunk(16, 8).unwrap()).unwrap();
        }
        assert_eq!(manager.total_in_use(), 3);

        receiver.release_queued_data();
        assert!(!receiver.has_data());
        assert_eq!(manager.total_in_use(), 0);
    }
}
