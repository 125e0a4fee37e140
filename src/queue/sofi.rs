//! Safely Overflowing FIFO (SoFi): a single-producer/single-consumer ring
//! that never refuses a push. When full, the push evicts the oldest entry
//! and hands it back to the caller, who owns releasing it.
//!
//! Eviction and a concurrent pop both want to advance the head, so both
//! sides claim it by CAS; the producer retries until it either evicted an
//! entry or observed the queue non-full again.

use crate::config::MAX_RECEIVER_QUEUE_CAPACITY;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// SPSC overwriting FIFO of `u64` cells. `repr(C)`, atomics only, so it
/// can live in shared memory. Index discipline matches [`Fifo`]: head and
/// tail run modulo `2 * capacity`.
///
/// [`Fifo`]: crate::queue::Fifo
#[repr(C, align(64))]
pub struct Sofi {
    head: AtomicU64,
    tail: AtomicU64,
    capacity: AtomicU64,
    cells: [AtomicU64; MAX_RECEIVER_QUEUE_CAPACITY],
}

impl Sofi {
    /// Create a SoFi with the given capacity.
    pub fn new(capacity: usize) -> Result<Box<Self>> {
        if capacity == 0 || capacity > MAX_RECEIVER_QUEUE_CAPACITY {
            return Err(Error::InvalidState(format!(
                "queue capacity {} out of range 1..={}",
                capacity, MAX_RECEIVER_QUEUE_CAPACITY
            )));
        }
        Ok(Box::new(Self {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            capacity: AtomicU64::new(capacity as u64),
            cells: std::array::from_fn(|_| AtomicU64::new(0)),
        }))
    }

    #[inline]
    fn advance(index: u64, capacity: u64) -> u64 {
        (index + 1) % (2 * capacity)
    }

    #[inline]
    fn distance(head: u64, tail: u64, capacity: u64) -> u64 {
        (tail + 2 * capacity - head) % (2 * capacity)
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed) as usize
    }

    /// Number of entries currently held (racy snapshot).
    pub fn len(&self) -> usize {
        let capacity = self.capacity.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        Self::distance(head, tail, capacity) as usize
    }

    /// Returns true if the queue holds no entries.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Push a value. Producer side only. Never fails.
    ///
    /// Returns the evicted oldest value when the queue was full, which the
    /// caller must release.
    pub fn push(&self, value: u64) -> Option<u64> {
        let capacity = self.capacity.load(Ordering::Relaxed);
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);

            if Self::distance(head, tail, capacity) < capacity {
                self.cells[(tail % capacity) as usize].store(value, Ordering::Release);
                self.tail.store(Self::advance(tail, capacity), Ordering::Release);
                return None;
            }

            // Full. When tail is exactly `capacity` ahead, tail and head
            // share a cell index, so claiming the head frees our write
            // slot. The consumer may be popping the same entry; the CAS
            // decides who owns it.
            let oldest = self.cells[(head % capacity) as usize].load(Ordering::Acquire);
            if self
                .head
                .compare_exchange(
                    head,
                    Self::advance(head, capacity),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.cells[(tail % capacity) as usize].store(value, Ordering::Release);
                self.tail.store(Self::advance(tail, capacity), Ordering::Release);
                return Some(oldest);
            }
            // Consumer won the head; the queue is no longer full.
            std::hint::spin_loop();
        }
    }

    /// Pop the oldest value. Consumer side only.
    ///
    /// Claims the head by CAS because an overflowing producer may be
    /// evicting the same entry concurrently.
    pub fn pop(&self) -> Option<u64> {
        let capacity = self.capacity.load(Ordering::Relaxed);
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }

            let value = self.cells[(head % capacity) as usize].load(Ordering::Acquire);
            if self
                .head
                .compare_exchange(
                    head,
                    Self::advance(head, capacity),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(value);
            }
            std::hint::spin_loop();
        }
    }

    /// Change the capacity, discarding the oldest entries if the queue
    /// holds more than `new_capacity`. The discarded values are returned
    /// for the caller to release.
    ///
    /// Consumer side only, and not safe against a concurrent producer.
    pub fn set_capacity(&self, new_capacity: usize) -> Result<Vec<u64>> {
        if new_capacity == 0 || new_capacity > MAX_RECEIVER_QUEUE_CAPACITY {
            return Err(Error::InvalidState(format!(
                "queue capacity {} out of range 1..={}",
                new_capacity, MAX_RECEIVER_QUEUE_CAPACITY
            )));
        }

        let mut entries = Vec::with_capacity(self.len());
        while let Some(value) = self.pop() {
            entries.push(value);
        }

        let discarded = if entries.len() > new_capacity {
            entries.drain(..entries.len() - new_capacity).collect()
        } else {
            Vec::new()
        };

        self.capacity.store(new_capacity as u64, Ordering::Relaxed);
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        for value in entries {
            // Cannot overflow: at most new_capacity entries survive.
            let evicted = self.push(value);
            debug_assert!(evicted.is_none());
        }
        Ok(discarded)
    }
}
