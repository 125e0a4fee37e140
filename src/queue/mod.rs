//! Lock-free SPSC queues and the chunk queue facade built on them.

mod chunk_queue;
mod fifo;
mod sofi;

pub use chunk_queue::{ChunkQueueData, ChunkQueueKind, ChunkQueuePopper, ChunkQueuePusher};
pub use fifo::Fifo;
pub use sofi::Sofi;
