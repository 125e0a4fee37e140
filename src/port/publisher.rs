//! Publisher port: offer lifecycle, chunk loaning, and publishing.

use super::distributor::{ChunkDistributor, QueueEntry};
use super::{ServiceDescription, UniquePortId};
use crate::config::{MAX_CHUNKS_HELD_PER_PORT, MAX_PUBLISHER_HISTORY};
use crate::error::{Error, Result};
use crate::memory::{MemoryManager, SharedChunk};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Creation options for a publisher port.
#[derive(Clone, Copy, Debug, Default)]
pub struct PublisherOptions {
    /// Samples retained for late-joining subscribers and
    /// `previous_sample`, <= [`MAX_PUBLISHER_HISTORY`].
    pub history_capacity: usize,
}

struct PublisherShared {
    /// Last `history_capacity` published samples, oldest first.
    history: VecDeque<SharedChunk>,
    /// Outstanding loans, scanned by the daemon on crash cleanup.
    loans: Vec<SharedChunk>,
}

/// Publisher-side port.
///
/// Exactly one producer thread uses `loan`/`publish` at a time; the
/// daemon thread concurrently connects and disconnects subscribers
/// through the distributor.
pub struct PublisherPort {
    service: ServiceDescription,
    id: UniquePortId,
    offered: AtomicBool,
    memory: Arc<MemoryManager>,
    distributor: ChunkDistributor,
    shared: Mutex<PublisherShared>,
    history_capacity: usize,
    next_sequence: AtomicU64,
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl PublisherPort {
    /// Create a port for `service` drawing chunks from `memory`.
    pub fn new(
        service: ServiceDescription,
        memory: Arc<MemoryManager>,
        options: PublisherOptions,
    ) -> Result<Self> {
        if options.history_capacity > MAX_PUBLISHER_HISTORY {
            return Err(Error::InvalidConfig(format!(
                "history capacity {} exceeds {}",
                options.history_capacity, MAX_PUBLISHER_HISTORY
            )));
        }
        // History pins chunks; it must never be able to pin a whole pool.
        if let Some(smallest) = memory.pools().first() {
            if options.history_capacity > smallest.capacity() {
                return Err(Error::InvalidConfig(format!(
                    "history capacity {} exceeds pool chunk count {}",
                    options.history_capacity,
                    smallest.capacity()
                )));
            }
        }

        Ok(Self {
            service,
            id: UniquePortId::next(),
            offered: AtomicBool::new(false),
            memory,
            distributor: ChunkDistributor::new(),
            shared: Mutex::new(PublisherShared {
                history: VecDeque::with_capacity(options.history_capacity),
                loans: Vec::new(),
            }),
            history_capacity: options.history_capacity,
            next_sequence: AtomicU64::new(0),
        })
    }

    /// This port's service description.
    pub fn service(&self) -> &ServiceDescription {
        &self.service
    }

    /// This port's unique id.
    pub fn id(&self) -> UniquePortId {
        self.id
    }

    /// Start offering. Matching subscribers are connected by the daemon.
    pub fn offer(&self) {
        if !self.offered.swap(true, Ordering::AcqRel) {
            tracing::info!(service = %self.service, port = %self.id, "publisher offered");
        }
    }

    /// Stop offering. The daemon disconnects subscribers in response.
    pub fn stop_offer(&self) {
        if self.offered.swap(false, Ordering::AcqRel) {
            tracing::info!(service = %self.service, port = %self.id, "publisher stopped offering");
        }
    }

    /// Returns true while the port is offered.
    pub fn is_offered(&self) -> bool {
        self.offered.load(Ordering::Acquire)
    }

    /// Loan a chunk for in-place construction of a sample.
    ///
    /// The chunk stays on the port's outstanding-loan list until
    /// [`publish`](Self::publish) or [`release_loan`](Self::release_loan).
    pub fn loan(&self, payload_size: usize, payload_alignment: usize) -> Result<SharedChunk> {
        let mut chunk = self.memory.get_chunk(payload_size, payload_alignment)?;
        if let Some(header) = chunk.header_mut() {
            header.originator_id = self.id.0;
        }

        let mut shared = self.shared.lock().expect("publisher state poisoned");
        if shared.loans.len() >= MAX_CHUNKS_HELD_PER_PORT {
            return Err(Error::ResourceExhausted(format!(
                "publisher holds {} outstanding loans",
                shared.loans.len()
            )));
        }
        shared.loans.push(chunk.clone());
        Ok(chunk)
    }

    /// Publish a loaned chunk to all connected subscribers.
    ///
    /// Stamps the sequence number and timestamp, fans the chunk out, and
    /// retires it into the history ring. Fails with
    /// [`Error::InvalidState`] if the port is not offered; the loan is
    /// returned either way.
    pub fn publish(&self, mut chunk: SharedChunk) -> Result<()> {
        self.retire_loan(&chunk);

        if !self.is_offered() {
            return Err(Error::InvalidState(
                "publish on a port that is not offered".into(),
            ));
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        if let Some(header) = chunk.header_mut() {
            header.sequence_number = sequence;
            header.timestamp_ns = now_nanos();
        }

        let delivered = self.distributor.deliver_to_all(&chunk);
        tracing::trace!(
            port = %self.id,
            sequence,
            delivered,
            "sample published"
        );

        if self.history_capacity > 0 {
            let mut shared = self.shared.lock().expect("publisher state poisoned");
            if shared.history.len() == self.history_capacity {
                shared.history.pop_front();
            }
            shared.history.push_back(chunk);
        }
        Ok(())
    }

    /// Return a loan without publishing. The chunk goes back to its pool
    /// once the caller's handle drops.
    pub fn release_loan(&self, chunk: SharedChunk) {
        self.retire_loan(&chunk);
    }

    /// The most recently published sample, if any is retained.
    pub fn previous_sample(&self) -> Option<SharedChunk> {
        let shared = self.shared.lock().expect("publisher state poisoned");
        shared.history.back().cloned()
    }

    /// Connect a subscriber queue and replay history into it. Called by
    /// the daemon.
    pub fn connect_subscriber(&self, entry: QueueEntry) -> Result<()> {
        // Snapshot history under the lock, replay outside it.
        let history: Vec<SharedChunk> = {
            let shared = self.shared.lock().expect("publisher state poisoned");
            shared.history.iter().cloned().collect()
        };
        self.distributor.deliver_historical(&entry, &history);
        self.distributor.add_queue(entry)
    }

    /// Disconnect a subscriber queue. Called by the daemon.
    pub fn disconnect_subscriber(&self, subscriber_id: UniquePortId) -> bool {
        self.distributor.remove_queue(subscriber_id)
    }

    /// Number of connected subscriber queues.
    pub fn subscriber_count(&self) -> usize {
        self.distributor.queue_count()
    }

    /// Number of outstanding loans.
    pub fn loan_count(&self) -> usize {
        self.shared
            .lock()
            .expect("publisher state poisoned")
            .loans
            .len()
    }

    /// Drop all outstanding loans and history. Used by the daemon when
    /// cleaning up after a dead process.
    pub fn release_all(&self) {
        let mut shared = self.shared.lock().expect("publisher state poisoned");
        shared.loans.clear();
        shared.history.clear();
    }

    fn retire_loan(&self, chunk: &SharedChunk) {
        let mut shared = self.shared.lock().expect("publisher state poisoned");
        if let Some(index) = shared.loans.iter().position(|l| l.ptr_eq(chunk)) {
            shared.loans.swap_remove(index);
        }
    }
}
