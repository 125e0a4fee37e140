//! Blocking primitives: the only two places the transport ever suspends.

mod condition;
mod semaphore;

pub use condition::{ConditionNotifier, ConditionVariable};
pub use semaphore::WakeSemaphore;
