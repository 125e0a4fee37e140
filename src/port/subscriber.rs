//! Subscriber port: subscribe lifecycle and sample retrieval.

use super::distributor::QueueEntry;
use super::receiver::ChunkReceiver;
use super::{ServiceDescription, UniquePortId};
use crate::error::{Error, Result};
use crate::memory::SharedChunk;
use crate::queue::{ChunkQueueData, ChunkQueueKind, ChunkQueuePopper, ChunkQueuePusher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Subscription state machine.
///
/// `subscribe` and `unsubscribe` move into the `*Requested` states; the
/// daemon's confirmations complete the transitions. Duplicate or stale
/// confirmations are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SubscribeState {
    /// Not subscribed; terminal state.
    NotSubscribed = 0,
    /// Subscription requested, waiting for the daemon to connect us.
    SubscribeRequested = 1,
    /// Connected to a publisher.
    Subscribed = 2,
    /// Unsubscription requested, waiting for the daemon to disconnect us.
    UnsubscribeRequested = 3,
}

impl SubscribeState {
    fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::SubscribeRequested,
            2 => Self::Subscribed,
            3 => Self::UnsubscribeRequested,
            _ => Self::NotSubscribed,
        }
    }
}

/// Creation options for a subscriber port.
#[derive(Clone, Copy, Debug)]
pub struct SubscriberOptions {
    /// Queue variant. SoFi keeps the freshest samples under load; FIFO
    /// never loses silently but saturates.
    pub queue_kind: ChunkQueueKind,
    /// Queue capacity.
    pub queue_capacity: usize,
    /// Historical samples requested from the publisher on connect.
    pub requested_history: usize,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            queue_kind: ChunkQueueKind::Sofi,
            queue_capacity: 16,
            requested_history: 0,
        }
    }
}

/// Subscriber-side port.
///
/// Exactly one consumer thread calls `take` at a time; the daemon thread
/// concurrently drives the subscription state machine.
pub struct SubscriberPort {
    service: ServiceDescription,
    id: UniquePortId,
    state: AtomicU32,
    queue: Arc<ChunkQueueData>,
    receiver: ChunkReceiver,
    requested_history: usize,
}

impl SubscriberPort {
    /// Create a port for `service`.
    pub fn new(service: ServiceDescription, options: SubscriberOptions) -> Result<Self> {
        let queue = Arc::new(ChunkQueueData::new(
            options.queue_kind,
            options.queue_capacity,
        )?);
        let receiver = ChunkReceiver::new(ChunkQueuePopper::new(Arc::clone(&queue)));
        Ok(Self {
            service,
            id: UniquePortId::next(),
            state: AtomicU32::new(SubscribeState::NotSubscribed as u32),
            queue,
            receiver,
            requested_history: options.requested_history,
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

    /// Current subscription state.
    pub fn state(&self) -> SubscribeState {
        SubscribeState::from_u32(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SubscribeState, to: SubscribeState) -> bool {
        self.state
            .compare_exchange(
                from as u32,
                to as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Request a subscription. Idempotent while requested or subscribed.
    ///
    /// Fails with [`Error::InvalidState`] while an unsubscription is in
    /// flight; the daemon's confirmation has to land first.
    pub fn subscribe(&self) -> Result<()> {
        match self.state() {
            SubscribeState::NotSubscribed => {
                if self.transition(
                    SubscribeState::NotSubscribed,
                    SubscribeState::SubscribeRequested,
                ) {
                    tracing::info!(service = %self.service, port = %self.id, "subscription requested");
                }
                Ok(())
            }
            SubscribeState::SubscribeRequested | SubscribeState::Subscribed => Ok(()),
            SubscribeState::UnsubscribeRequested => Err(Error::InvalidState(
                "subscribe while unsubscription is in flight".into(),
            )),
        }
    }

    /// Request an unsubscription. Idempotent while not subscribed.
    pub fn unsubscribe(&self) -> Result<()> {
        match self.state() {
            SubscribeState::Subscribed => {
                if self.transition(
                    SubscribeState::Subscribed,
                    SubscribeState::UnsubscribeRequested,
                ) {
                    tracing::info!(service = %self.service, port = %self.id, "unsubscription requested");
                }
                Ok(())
            }
            // Not connected yet: withdraw the request directly.
            SubscribeState::SubscribeRequested => {
                self.transition(
                    SubscribeState::SubscribeRequested,
                    SubscribeState::NotSubscribed,
                );
                Ok(())
            }
            SubscribeState::NotSubscribed | SubscribeState::UnsubscribeRequested => Ok(()),
        }
    }

    /// Daemon confirmation: the publisher attached our queue.
    /// Duplicates and stale confirmations are ignored.
    pub fn confirm_subscription(&self) {
        if self.transition(
            SubscribeState::SubscribeRequested,
            SubscribeState::Subscribed,
        ) {
            tracing::debug!(port = %self.id, "subscription confirmed");
        }
    }

    /// Daemon confirmation: the publisher detached our queue.
    /// Duplicates and stale confirmations are ignored.
    pub fn confirm_unsubscription(&self) {
        if self.transition(
            SubscribeState::UnsubscribeRequested,
            SubscribeState::NotSubscribed,
        ) {
            tracing::debug!(port = %self.id, "unsubscription confirmed");
        }
    }

    /// Daemon notification: the publisher went away while we were
    /// subscribed. We fall back to waiting for a new match.
    pub fn demote_to_requested(&self) {
        if self.transition(
            SubscribeState::Subscribed,
            SubscribeState::SubscribeRequested,
        ) {
            tracing::debug!(port = %self.id, "publisher lost, waiting for rematch");
        }
    }

    /// Take the oldest queued sample.
    ///
    /// Fails with [`Error::NotSubscribed`] outside the SUBSCRIBED state
    /// and [`Error::NoChunkAvailable`] on an empty queue.
    pub fn take(&self) -> Result<SharedChunk> {
        if self.state() != SubscribeState::Subscribed {
            return Err(Error::NotSubscribed);
        }
        self.receiver.take().ok_or(Error::NoChunkAvailable)
    }

    /// Returns true if at least one sample is queued.
    pub fn has_data(&self) -> bool {
        self.receiver.has_data()
    }

    /// Returns true if samples were lost since the last call, clearing
    /// the missed flag.
    pub fn has_missed_data(&self) -> bool {
        self.receiver.has_missed_data()
    }

    /// Drain the queue, releasing every queued sample.
    pub fn release_queued_data(&self) {
        self.receiver.release_queued_data()
    }

    /// The receiver, for queue-level operations (wake semaphore,
    /// capacity).
    pub fn receiver(&self) -> &ChunkReceiver {
        &self.receiver
    }

    /// The queue state shared with the publisher side.
    pub fn queue(&self) -> &Arc<ChunkQueueData> {
        &self.queue
    }

    /// Build the distributor entry the daemon hands to a matched
    /// publisher.
    pub fn queue_entry(&self) -> QueueEntry {
        QueueEntry {
            pusher: ChunkQueuePusher::new(Arc::clone(&self.queue)),
            subscriber_id: self.id,
            requested_history: self.requested_history,
        }
    }
}
