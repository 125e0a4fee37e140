//! Saturating single-producer/single-consumer FIFO.
//!
//! A bounded lock-free ring of `u64` cells. Head and tail are kept modulo
//! `2 * capacity`, so "empty" (head == tail) and "full" (tail exactly
//! `capacity` ahead) are distinguishable without a separate count. A push
//! against a full queue fails; nothing is ever overwritten.
//!
//! The release store on push pairs with the acquire load on pop, so
//! everything written into a chunk before its offset was pushed
//! happens-before the popping side's reads.

use crate::config::MAX_RECEIVER_QUEUE_CAPACITY;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// SPSC saturating FIFO of `u64` cells. `repr(C)`, atomics only, so it can
/// live in shared memory.
#[repr(C, align(64))]
pub struct Fifo {
    /// Consumer index in `[0, 2 * capacity)`.
    head: AtomicU64,
    /// Producer index in `[0, 2 * capacity)`.
    tail: AtomicU64,
    /// Current logical capacity, <= `MAX_RECEIVER_QUEUE_CAPACITY`.
    capacity: AtomicU64,
    cells: [AtomicU64; MAX_RECEIVER_QUEUE_CAPACITY],
}

impl Fifo {
    /// Create a FIFO with the given capacity.
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

    /// Number of entries currently held. A racy snapshot, exact only when
    /// no producer is active.
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

    /// Push a value. Producer side only.
    ///
    /// Fails with [`Error::QueueOverflow`] when the queue is full; the
    /// value is returned to the caller untouched in that case (the error
    /// carries no payload, the caller still owns `value`).
    pub fn push(&self, value: u64) -> Result<()> {
        let capacity = self.capacity.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if Self::distance(head, tail, capacity) == capacity {
            return Err(Error::QueueOverflow);
        }

        self.cells[(tail % capacity) as usize].store(value, Ordering::Release);
        self.tail.store(Self::advance(tail, capacity), Ordering::Release);
        Ok(())
    }

    /// Pop the oldest value. Consumer side only.
    pub fn pop(&self) -> Option<u64> {
        let capacity = self.capacity.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let value = self.cells[(head % capacity) as usize].load(Ordering::Acquire);
        self.head.store(Self::advance(head, capacity), Ordering::Release);
        Some(value)
    }

    /// Shrink or grow the capacity. Consumer side only, and not safe
    /// against a concurrent producer.
    ///
    /// Fails if the queue currently holds more than `new_capacity`
    /// entries.
    pub fn set_capacity(&self, new_capacity: usize) -> Result<()> {
        if new_capacity == 0 || new_capacity > MAX_RECEIVER_QUEUE_CAPACITY {
            return Err(Error::InvalidState(format!(
                "queue capacity {} out of range 1..={}",
                new_capacity, MAX_RECEIVER_QUEUE_CAPACITY
            )));
        }
        let held = self.len();
        if held > new_capacity {
            return Err(Error::InvalidState(format!(
                "queue holds {} entries, cannot shrink to {}",
                held, new_capacity
            )));
        }

        // Rebase the surviving entries to index 0 under the new modulus.
        let mut entries = Vec::with_capacity(held);
        while let Some(value) = self.pop() {
            entries.push(value);
        }
        self.capacity.store(new_capacity as u64, Ordering::Relaxed);
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        for value in entries {
            self.push(value).expect("rebase cannot overflow");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_empty() {
        let fifo = Fifo::new(4).unwrap();
        assert!(fifo.is_empty());
        assert_eq!(fifo.len(), 0);
        assert_eq!(fifo.capacity(), 4);
        assert!(fifo.pop().is_none());
    }

    #[test]
    fn test_push_pop_order() {
        let fifo = Fifo::new(8).unwrap();
        for value in 1..=5u64 {
            fifo.push(value).unwrap();
        }
        for expected in 1..=5u64 {
            assert_eq!(fifo.pop(), Some(expected));
        }
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_overflow_fails_and_preserves_contents() {
        let fifo = Fifo::new(3).unwrap();
        fifo.push(1).unwrap();
        fifo.push(2).unwrap();
        fifo.push(3).unwrap();

        assert!(matches!(fifo.push(4), Err(Error::QueueOverflow)));
        assert_eq!(fifo.len(), 3);
        assert_eq!(fifo.pop(), Some(1));
    }

    #[test]
    fn test_wrap_around() {
        let fifo = Fifo::new(2).unwrap();
        for round in 0..10u64 {
            fifo.push(round * 2).unwrap();
            fifo.push(round * 2 + 1).unwrap();
            assert_eq!(fifo.pop(), Some(round * 2));
            assert_eq!(fifo.pop(), Some(round * 2 + 1));
        }
    }

    #[test]
    fn test_set_capacity_shrink() {
        let fifo = Fifo::new(8).unwrap();
        fifo.push(1).unwrap();
        fifo.push(2).unwrap();

        fifo.set_capacity(2).unwrap();
        assert_eq!(fifo.capacity(), 2);
        assert_eq!(fifo.pop(), Some(1));
        assert_eq!(fifo.pop(), Some(2));
        assert!(fifo.pop().is_none());
    }

    #[test]
    fn test_set_capacity_fails_when_holding_more() {
        let fifo = Fifo::new(8).unwrap();
        for value in 0..5u64 {
            fifo.push(value).unwrap();
        }
        assert!(fifo.set_capacity(3).is_err());
        // Contents untouched by the failed shrink.
        assert_eq!(fifo.len(), 5);
        assert_eq!(fifo.pop(), Some(0));
    }

    #[test]
    fn test_capacity_bounds() {
        assert!(Fifo::new(0).is_err());
        assert!(Fifo::new(MAX_RECEIVER_QUEUE_CAPACITY + 1).is_err());
        assert!(Fifo::new(MAX_RECEIVER_QUEUE_CAPACITY).is_ok());
    }

    #[test]
    fn test_spsc_threads_preserve_order() {
        use std::sync::Arc;

        let fifo: Arc<Fifo> = Arc::from(Fifo::new(16).unwrap());
        let producer_fifo = Arc::clone(&fifo);

        const COUNT: u64 = 10_000;
        let producer = std::thread::spawn(move || {
            let mut next = 1u64;
            while next <= COUNT {
                if producer_fifo.push(next).is_ok() {
                    next += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 1u64;
        while expected <= COUNT {
            if let Some(value) = fifo.pop() {
                assert_eq!(value, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }

        producer.join().unwrap();
        assert!(fifo.is_empty());
    }
}
