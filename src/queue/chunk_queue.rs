//! Chunk queue: the pipe between one publisher and one subscriber.
//!
//! A thin facade over [`Fifo`] or [`Sofi`] that carries [`SharedChunk`]
//! handles as packed relative pointers. Pushing moves the handle's
//! refcount contribution into the queue cell; popping moves it back out,
//! so a chunk sitting in a queue counts as referenced and is never
//! recycled under a slow subscriber.
//!
//! A queue can carry two optional attachments: a wake semaphore
//! (level-like, posted on every successful push) and a condition notifier
//! (wakes a WaitSet). Attachment is one-shot per slot.

use super::fifo::Fifo;
use super::sofi::Sofi;
use crate::error::{Error, Result};
use crate::memory::SharedChunk;
use crate::sync::{ConditionNotifier, WakeSemaphore};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

/// Which ring variant backs a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkQueueKind {
    /// Saturating FIFO: pushes fail when full, nothing is lost silently.
    Fifo,
    /// Overwriting FIFO: pushes evict the oldest entry when full.
    Sofi,
}

enum Ring {
    Fifo(Box<Fifo>),
    Sofi(Box<Sofi>),
}

/// Shared state of one subscriber queue.
///
/// The pusher lives with the publisher's distributor, the popper with the
/// subscriber's receiver; both reference this through an `Arc`.
pub struct ChunkQueueData {
    ring: Ring,
    kind: ChunkQueueKind,
    /// Pushes lost to FIFO overflow since the last query.
    missed: AtomicU64,
    wake: Mutex<Option<WakeSemaphore>>,
    notifier: Mutex<Option<ConditionNotifier>>,
    /// Edge flag for WaitSet event attachments, set on every push.
    event_flag: Mutex<Option<Arc<std::sync::atomic::AtomicBool>>>,
}

impl ChunkQueueData {
    /// Create a queue of the given variant and capacity.
    pub fn new(kind: ChunkQueueKind, capacity: usize) -> Result<Self> {
        let ring = match kind {
            ChunkQueueKind::Fifo => Ring::Fifo(Fifo::new(capacity)?),
            ChunkQueueKind::Sofi => Ring::Sofi(Sofi::new(capacity)?),
        };
        Ok(Self {
            ring,
            kind,
            missed: AtomicU64::new(0),
            wake: Mutex::new(None),
            notifier: Mutex::new(None),
            event_flag: Mutex::new(None),
        })
    }

    /// The ring variant backing this queue.
    pub fn kind(&self) -> ChunkQueueKind {
        self.kind
    }

    /// Push a chunk handle, transferring its refcount contribution into
    /// the queue.
    ///
    /// SoFi eviction releases the displaced handle here. A FIFO overflow
    /// drops the pushed handle, bumps the missed counter, and returns
    /// [`Error::QueueOverflow`].
    pub fn push(&self, chunk: SharedChunk) -> Result<()> {
        let cell = chunk.into_cell();
        match &self.ring {
            Ring::Fifo(fifo) => {
                if let Err(e) = fifo.push(cell) {
                    self.missed.fetch_add(1, Ordering::Relaxed);
                    // Reclaim the contribution the cell never took.
                    drop(SharedChunk::from_cell(cell));
                    tracing::debug!("chunk queue overflow, sample dropped");
                    return Err(e);
                }
            }
            Ring::Sofi(sofi) => {
                if let Some(evicted) = sofi.push(cell) {
                    drop(SharedChunk::from_cell(evicted));
                }
            }
        }
        self.signal();
        Ok(())
    }

    /// Pop the oldest chunk, taking back its refcount contribution.
    pub fn pop(&self) -> Option<SharedChunk> {
        loop {
            let cell = match &self.ring {
                Ring::Fifo(fifo) => fifo.pop()?,
                Ring::Sofi(sofi) => sofi.pop()?,
            };
            let chunk = SharedChunk::from_cell(cell);
            // A cell surviving from an unmapped segment yields the empty
            // handle; skip it rather than hand garbage to the caller.
            if chunk.is_valid() {
                return Some(chunk);
            }
        }
    }

    /// Returns true if the queue holds no chunks.
    pub fn is_empty(&self) -> bool {
        match &self.ring {
            Ring::Fifo(fifo) => fifo.is_empty(),
            Ring::Sofi(sofi) => sofi.is_empty(),
        }
    }

    /// Number of chunks currently held (racy snapshot).
    pub fn len(&self) -> usize {
        match &self.ring {
            Ring::Fifo(fifo) => fifo.len(),
            Ring::Sofi(sofi) => sofi.len(),
        }
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        match &self.ring {
            Ring::Fifo(fifo) => fifo.capacity(),
            Ring::Sofi(sofi) => sofi.capacity(),
        }
    }

    /// Change the capacity. Consumer side only, not safe against a
    /// concurrent producer.
    ///
    /// A SoFi shrink discards (and releases) the oldest entries; a FIFO
    /// refuses to shrink below its current fill.
    pub fn set_capacity(&self, new_capacity: usize) -> Result<()> {
        match &self.ring {
            Ring::Fifo(fifo) => fifo.set_capacity(new_capacity),
            Ring::Sofi(sofi) => {
                for cell in sofi.set_capacity(new_capacity)? {
                    drop(SharedChunk::from_cell(cell));
                }
                Ok(())
            }
        }
    }

    /// Drain the queue, releasing every held chunk. Consumer side only.
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }

    /// Number of samples lost to FIFO overflow, clearing the counter.
    pub fn take_missed(&self) -> u64 {
        self.missed.swap(0, Ordering::Relaxed)
    }

    /// Attach the wake semaphore posted on every successful push.
    ///
    /// Fails with [`Error::SemaphoreAlreadySet`] if one is attached.
    pub fn attach_semaphore(&self, semaphore: WakeSemaphore) -> Result<()> {
        let mut slot = self.wake.lock().expect("wake slot poisoned");
        if slot.is_some() {
            return Err(Error::SemaphoreAlreadySet);
        }
        *slot = Some(semaphore);
        Ok(())
    }

    /// Returns true if a wake semaphore is attached.
    pub fn is_semaphore_attached(&self) -> bool {
        self.wake.lock().expect("wake slot poisoned").is_some()
    }

    /// Attach a condition notifier (WaitSet wake path).
    ///
    /// Fails with [`Error::ConditionAlreadySet`] if one is attached.
    pub fn attach_condition(&self, notifier: ConditionNotifier) -> Result<()> {
        let mut slot = self.notifier.lock().expect("notifier slot poisoned");
        if slot.is_some() {
            return Err(Error::ConditionAlreadySet);
        }
        *slot = Some(notifier);
        Ok(())
    }

    /// Detach the condition notifier, if any.
    pub fn detach_condition(&self) {
        *self.notifier.lock().expect("notifier slot poisoned") = None;
    }

    /// Install the edge flag a WaitSet event attachment observes. Set to
    /// true on every push; the trigger predicate swaps it back to false.
    pub fn attach_event_flag(&self, flag: Arc<std::sync::atomic::AtomicBool>) {
        *self.event_flag.lock().expect("event flag poisoned") = Some(flag);
    }

    /// Remove the edge flag, if any.
    pub fn detach_event_flag(&self) {
        *self.event_flag.lock().expect("event flag poisoned") = None;
    }

    fn signal(&self) {
        if let Some(flag) = &*self.event_flag.lock().expect("event flag poisoned") {
            flag.store(true, Ordering::Release);
        }
        if let Some(semaphore) = &*self.wake.lock().expect("wake slot poisoned") {
            semaphore.post();
        }
        if let Some(notifier) = &*self.notifier.lock().expect("notifier slot poisoned") {
            notifier.notify();
        }
    }
}

/// Producer half of a chunk queue. Held by the publisher's distributor;
/// exactly one producer thread may use it at a time.
#[derive(Clone)]
pub struct ChunkQueuePusher {
    queue: Arc<ChunkQueueData>,
}

impl ChunkQueuePusher {
    /// Wrap the producing side of `queue`.
    pub fn new(queue: Arc<ChunkQueueData>) -> Self {
        Self { queue }
    }

    /// Push a chunk. See [`ChunkQueueData::push`].
    pub fn push(&self, chunk: SharedChunk) -> Result<()> {
        self.queue.push(chunk)
    }

    /// The shared queue state.
    pub fn queue(&self) -> &Arc<ChunkQueueData> {
        &self.queue
    }
}

/// Consumer half of a chunk queue. Held by the subscriber's receiver;
/// exactly one consumer thread may use it at a time.
pub struct ChunkQueuePopper {
    queue: Arc<ChunkQueueData>,
}

impl ChunkQueuePopper {
    /// Wrap the consuming side of `queue`.
    pub fn new(queue: Arc<ChunkQueueData>) -> Self {
        Self { queue }
    }

    /// Pop the oldest chunk. See [`ChunkQueueData::pop`].
    pub fn pop(&self) -> Option<SharedChunk> {
        self.queue.pop()
    }

    /// Returns true if the queue holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of chunks currently held.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Drain the queue, releasing every held chunk.
    pub fn clear(&self) {
        self.queue.clear()
    }

    /// Samples lost to FIFO overflow since the last query.
    pub fn take_missed(&self) -> u64 {
        self.queue.take_missed()
    }

    /// Attach the wake semaphore. See [`ChunkQueueData::attach_semaphore`].
    pub fn attach_semaphore(&self, semaphore: WakeSemaphore) -> Result<()> {
        self.queue.attach_semaphore(semaphore)
    }

    /// Returns true if a wake semaphore is attached.
    pub fn is_semaphore_attached(&self) -> bool {
        self.queue.is_semaphore_attached()
    }

    /// Change capacity from the consumer side. See
    /// [`ChunkQueueData::set_capacity`].
    pub fn set_capacity(&self, new_capacity: usize) -> Result<()> {
        self.queue.set_capacity(new_capacity)
    }

    /// The shared queue state.
    pub fn queue(&self) -> &Arc<ChunkQueueData> {
        &self.queue
    }
}
