//! Error types for axon.

use thiserror::Error;

/// Result type alias using axon's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for axon operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Chunk allocation failed (pool exhausted or no fitting size class).
    /// Retryable once outstanding chunks are released.
    #[error("chunk allocation failed: {0}")]
    AllocationFailed(String),

    /// A saturating FIFO queue was full. The subscriber's missed counter
    /// records the loss.
    #[error("queue overflow: queue is full")]
    QueueOverflow,

    /// A wake semaphore is already attached to this queue.
    #[error("a wake semaphore is already attached")]
    SemaphoreAlreadySet,

    /// A condition notifier is already attached to this queue.
    #[error("a condition notifier is already attached")]
    ConditionAlreadySet,

    /// The subscriber port is not in the SUBSCRIBED state.
    #[error("not subscribed")]
    NotSubscribed,

    /// No chunk is available to take. Benign steady-state signal.
    #[error("no chunk available")]
    NoChunkAvailable,

    /// Operation called in the wrong port or queue state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A bounded table (ports, subscriber list, triggers, loans) is full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invalid shared memory segment operation.
    #[error("invalid memory segment: {0}")]
    InvalidSegment(String),

    /// Invalid runtime configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Wire message could not be decoded (truncated or malformed frame).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
