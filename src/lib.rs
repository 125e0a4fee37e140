//! # axon
//!
//! A true zero-copy shared-memory inter-process publish/subscribe
//! transport for safety-critical robotics and automotive workloads.
//!
//! Publishers loan fixed-size chunks directly out of a shared memory
//! pool, populate them in place, and publish; a distributor fans the
//! chunk out to every connected subscriber queue by reference. No
//! serialization, no copy: the chunk returns to its pool when the last
//! handle anywhere on the host drops.
//!
//! ## Features
//!
//! - **Shared-memory chunk pools**: lock-free size-class allocators with
//!   cross-process refcounting
//! - **SPSC chunk queues**: saturating FIFO or overwriting SoFi per
//!   subscriber
//! - **Port state machines**: offer/subscribe lifecycle driven by the
//!   discovery daemon's registry
//! - **WaitSet**: block one thread on events from many ports
//! - **Crash cleanup**: flock-based liveness tokens; the daemon fences
//!   dead processes and reclaims their chunks
//!
//! ## Quick start
//!
//! ```rust
//! use axon::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> axon::Result<()> {
//! let config = RuntimeConfig::new("demo", vec![PoolConfig::new(1024, 64)]);
//! let memory = Arc::new(MemoryManager::create(&config)?);
//!
//! let service = ServiceDescription::new("radar", "front", "objects");
//! let publisher = Arc::new(PublisherPort::new(
//!     service.clone(),
//!     Arc::clone(&memory),
//!     PublisherOptions::default(),
//! )?);
//! let subscriber = Arc::new(SubscriberPort::new(service, SubscriberOptions::default())?);
//!
//! let registry = PortRegistry::new();
//! registry.register_publisher(Arc::clone(&publisher), "demo")?;
//! registry.register_subscriber(Arc::clone(&subscriber), "demo")?;
//!
//! publisher.offer();
//! subscriber.subscribe()?;
//! registry.process_matches();
//!
//! let mut sample = publisher.loan(11, 8)?;
//! sample.payload_mut().unwrap().copy_from_slice(b"hello world");
//! publisher.publish(sample)?;
//!
//! let received = subscriber.take()?;
//! assert_eq!(received.payload().unwrap(), b"hello world");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod daemon;
pub mod error;
pub mod memory;
pub mod port;
pub mod queue;
pub mod sync;
pub mod waitset;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{Limits, PoolConfig, RuntimeConfig};
    pub use crate::daemon::PortRegistry;
    pub use crate::error::{Error, Result};
    pub use crate::memory::{MemoryManager, SharedChunk};
    pub use crate::port::{
        PublisherOptions, PublisherPort, ServiceDescription, SubscriberOptions, SubscriberPort,
    };
    pub use crate::queue::ChunkQueueKind;
    pub use crate::waitset::{SubscriberEvent, SubscriberState, WaitSet};
}

pub use error::{Error, Result};
