//! Wake semaphore for subscriber queues.
//!
//! Backed by a non-blocking eventfd. A `read` consumes the whole counter,
//! so any number of posts between two waits collapse into a single wake:
//! the semaphore is level-like, and waiters must drain their queue fully
//! per wake. The fd can be duplicated and sent to another process, which
//! is what makes the wake path work across the publisher/subscriber
//! process boundary.

use crate::error::Result;
use rustix::event::{EventfdFlags, PollFd, PollFlags, eventfd, poll};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

fn timeout_millis(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

/// A level-like wake semaphore.
pub struct WakeSemaphore {
    fd: OwnedFd,
}

impl WakeSemaphore {
    /// Create a semaphore with the given initial count.
    pub fn new(initial: u32) -> Result<Self> {
        let fd = eventfd(initial, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        Ok(Self { fd })
    }

    /// Post the semaphore.
    ///
    /// Never blocks: if the counter is saturated the waiter is already
    /// guaranteed to wake, so the post is dropped.
    pub fn post(&self) {
        let buf = 1u64.to_ne_bytes();
        match rustix::io::write(&self.fd, &buf) {
            Ok(_) => {}
            Err(rustix::io::Errno::AGAIN) => {}
            Err(e) => tracing::warn!(error = %e, "semaphore post failed"),
        }
    }

    /// Consume the pending wake without blocking.
    ///
    /// Returns true if the semaphore had been posted since the last wait.
    /// All posts since then are consumed at once.
    pub fn try_wait(&self) -> bool {
        let mut buf = [0u8; 8];
        match rustix::io::read(&self.fd, &mut buf) {
            Ok(_) => true,
            Err(rustix::io::Errno::AGAIN) => false,
            Err(e) => {
                tracing::warn!(error = %e, "semaphore read failed");
                false
            }
        }
    }

    /// Block until posted.
    pub fn wait(&self) -> Result<()> {
        loop {
            if self.try_wait() {
                return Ok(());
            }
            let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
            poll(&mut fds, -1)?;
        }
    }

    /// Block until posted or the timeout elapses. The timeout is measured
    /// on the monotonic clock.
    ///
    /// Returns true if the semaphore was consumed, false on timeout.
    pub fn timed_wait(&self, timeout: Duration) -> Result<bool> {
        if self.try_wait() {
            return Ok(true);
        }
        let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
        let ready = poll(&mut fds, timeout_millis(timeout))?;
        if ready == 0 {
            return Ok(false);
        }
        Ok(self.try_wait())
    }

    /// Duplicate the semaphore. Both handles post and wait on the same
    /// kernel counter; the duplicate can be passed to another process.
    pub fn try_clone(&self) -> Result<Self> {
        let fd = rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?;
        Ok(Self { fd })
    }
}

impl AsFd for WakeSemaphore {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_wait_on_fresh_semaphore() {
        let semaphore = WakeSemaphore::new(0).unwrap();
        assert!(!semaphore.try_wait());
    }

    #[test]
    fn test_post_then_try_wait() {
        let semaphore = WakeSemaphore::new(0).unwrap();
        semaphore.post();
        assert!(semaphore.try_wait());
        assert!(!semaphore.try_wait());
    }

    #[test]
    fn test_posts_collapse_into_one_wake() {
        let semaphore = WakeSemaphore::new(0).unwrap();
        semaphore.post();
        semaphore.post();
        semaphore.post();
        assert!(semaphore.try_wait());
        // Level-like: one wait consumed everything.
        assert!(!semaphore.try_wait());
    }

    #[test]
    fn test_initial_count() {
        let semaphore = WakeSemaphore::new(1).unwrap();
        assert!(semaphore.try_wait());
        assert!(!semaphore.try_wait());
    }

    #[test]
    fn test_timed_wait_timeout() {
        let semaphore = WakeSemaphore::new(0).unwrap();
        let woke = semaphore
            .timed_wait(Duration::from_millis(10))
            .unwrap();
        assert!(!woke);
    }

    #[test]
    fn test_timed_wait_signaled() {
        let semaphore = WakeSemaphore::new(0).unwrap();
        semaphore.post();
        assert!(semaphore.timed_wait(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_clone_shares_counter() {
        let semaphore = WakeSemaphore::new(0).unwrap();
        let clone = semaphore.try_clone().unwrap();
        clone.post();
        assert!(semaphore.try_wait());
    }

    #[test]
    fn test_cross_thread_wake() {
        let semaphore = WakeSemaphore::new(0).unwrap();
        let poster = semaphore.try_clone().unwrap();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            poster.post();
        });

        assert!(semaphore.timed_wait(Duration::from_secs(2)).unwrap());
        handle.join().unwrap();
    }
}
