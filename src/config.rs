//! Runtime configuration: memory pool layout and transport limits.

use crate::error::{Error, Result};

/// Maximum number of entries a receiver queue can hold. The ring's backing
/// array in shared memory is sized for this; `set_capacity` can only shrink
/// below it.
pub const MAX_RECEIVER_QUEUE_CAPACITY: usize = 256;

/// Maximum number of subscriber queues a single publisher fans out to.
pub const MAX_SUBSCRIBERS_PER_PUBLISHER: usize = 16;

/// Maximum number of published samples a publisher retains for late joiners.
pub const MAX_PUBLISHER_HISTORY: usize = 16;

/// Maximum number of triggers a WaitSet can hold.
pub const MAX_TRIGGERS: usize = 128;

/// Maximum number of publisher ports a daemon registry manages.
pub const MAX_PUBLISHERS: usize = 512;

/// Maximum number of subscriber ports a daemon registry manages.
pub const MAX_SUBSCRIBERS: usize = 1024;

/// Maximum number of outstanding loans a single port may hold. Bounds the
/// per-port list the daemon scans during crash cleanup.
pub const MAX_CHUNKS_HELD_PER_PORT: usize = 256;

/// Minimum chunk size of a memory pool.
pub const MIN_CHUNK_SIZE: usize = 32;

/// Description of a single fixed-size-class memory pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Size of each chunk in bytes. Must be a power of two >= 32.
    pub chunk_size: usize,
    /// Number of chunks in this pool.
    pub chunk_count: usize,
}

impl PoolConfig {
    /// Create a pool description.
    pub const fn new(chunk_size: usize, chunk_count: usize) -> Self {
        Self {
            chunk_size,
            chunk_count,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size < MIN_CHUNK_SIZE || !self.chunk_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "chunk size {} must be a power of two >= {}",
                self.chunk_size, MIN_CHUNK_SIZE
            )));
        }
        if self.chunk_count == 0 {
            return Err(Error::InvalidConfig("chunk count must be > 0".into()));
        }
        Ok(())
    }
}

/// Tunable per-runtime limits. The compile-time constants above bound the
/// shared-memory layouts; these runtime values may only tighten them.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Default capacity of a newly created receiver queue.
    pub receiver_queue_capacity: usize,
    /// Subscriber fan-out per publisher.
    pub subscribers_per_publisher: usize,
    /// History samples retained per publisher.
    pub publisher_history: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            receiver_queue_capacity: MAX_RECEIVER_QUEUE_CAPACITY,
            subscribers_per_publisher: MAX_SUBSCRIBERS_PER_PUBLISHER,
            publisher_history: MAX_PUBLISHER_HISTORY,
        }
    }
}

impl Limits {
    fn validate(&self) -> Result<()> {
        if self.receiver_queue_capacity == 0
            || self.receiver_queue_capacity > MAX_RECEIVER_QUEUE_CAPACITY
        {
            return Err(Error::InvalidConfig(format!(
                "receiver queue capacity {} out of range 1..={}",
                self.receiver_queue_capacity, MAX_RECEIVER_QUEUE_CAPACITY
            )));
        }
        if self.subscribers_per_publisher == 0
            || self.subscribers_per_publisher > MAX_SUBSCRIBERS_PER_PUBLISHER
        {
            return Err(Error::InvalidConfig(format!(
                "subscribers per publisher {} out of range 1..={}",
                self.subscribers_per_publisher, MAX_SUBSCRIBERS_PER_PUBLISHER
            )));
        }
        if self.publisher_history > MAX_PUBLISHER_HISTORY {
            return Err(Error::InvalidConfig(format!(
                "publisher history {} exceeds {}",
                self.publisher_history, MAX_PUBLISHER_HISTORY
            )));
        }
        Ok(())
    }
}

/// Declarative description of a runtime: its name (used for shared memory
/// and liveness token naming), its memory pools, and its limits.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Runtime name. Shared memory objects are created as `axon-<name>`.
    pub name: String,
    /// Memory pools, one per payload size class.
    pub pools: Vec<PoolConfig>,
    /// Transport limits.
    pub limits: Limits,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            // Size classes roughly doubling, small-message biased.
            pools: vec![
                PoolConfig::new(128, 1024),
                PoolConfig::new(1024, 256),
                PoolConfig::new(16 * 1024, 64),
                PoolConfig::new(128 * 1024, 16),
            ],
            limits: Limits::default(),
        }
    }
}

impl RuntimeConfig {
    /// Create a config with the given name and pools, default limits.
    pub fn new(name: impl Into<String>, pools: Vec<PoolConfig>) -> Self {
        Self {
            name: name.into(),
            pools,
            limits: Limits::default(),
        }
    }

    /// Validate the configuration.
    ///
    /// Pools must be non-empty with power-of-two chunk sizes and strictly
    /// increasing size classes; limits must respect the compile-time caps.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("runtime name must not be empty".into()));
        }
        if self.pools.is_empty() {
            return Err(Error::InvalidConfig("at least one pool is required".into()));
        }
        let mut previous = 0usize;
        for pool in &self.pools {
            pool.validate()?;
            if pool.chunk_size <= previous {
                return Err(Error::InvalidConfig(
                    "pool chunk sizes must be strictly increasing".into(),
                ));
            }
            previous = pool.chunk_size;
        }
        self.limits.validate()
    }

    /// Total number of chunks across all pools. The management pool is
    /// sized to this, so every payload chunk can have a management record.
    pub fn total_chunk_count(&self) -> usize {
        self.pools.iter().map(|p| p.chunk_count).sum()
    }
}
