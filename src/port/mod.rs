//! Publisher and subscriber ports: the per-endpoint state machines that
//! mediate between an application and the transport.

mod distributor;
mod publisher;
mod receiver;
mod subscriber;

pub use distributor::{ChunkDistributor, QueueEntry};
pub use publisher::{PublisherOptions, PublisherPort};
pub use receiver::ChunkReceiver;
pub use subscriber::{SubscribeState, SubscriberOptions, SubscriberPort};

use std::sync::atomic::{AtomicU64, Ordering};

/// The three-part name by which publishers and subscribers are matched.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug, PartialEq, Eq, Hash))]
pub struct ServiceDescription {
    /// Service name.
    pub service: String,
    /// Instance of the service.
    pub instance: String,
    /// Event within the instance.
    pub event: String,
}

impl ServiceDescription {
    /// Create a service description from its three parts.
    pub fn new(
        service: impl Into<String>,
        instance: impl Into<String>,
        event: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            instance: instance.into(),
            event: event.into(),
        }
    }
}

impl std::fmt::Display for ServiceDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.instance, self.event)
    }
}

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically increasing port identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniquePortId(pub u64);

impl UniquePortId {
    /// Allocate the next port id.
    pub fn next() -> Self {
        Self(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for UniquePortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Port({})", self.0)
    }
}
