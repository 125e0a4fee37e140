//! Condition variable for WaitSet blocking.
//!
//! Like the wake semaphore this is an eventfd, but split into two roles:
//! the [`ConditionVariable`] is the waiting side (held by the WaitSet),
//! and [`ConditionNotifier`]s are cheap duplicates handed to the ports
//! whose state changes should wake the waiter. Waits re-check their
//! predicates after every wake, so collapsed or spurious notifications
//! are harmless.

use crate::error::Result;
use rustix::event::{EventfdFlags, PollFd, PollFlags, eventfd, poll};
use rustix::fd::OwnedFd;
use std::time::Duration;

/// The waiting side of a condition.
pub struct ConditionVariable {
    fd: OwnedFd,
}

impl ConditionVariable {
    /// Create an unsignaled condition.
    pub fn new() -> Result<Self> {
        let fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        Ok(Self { fd })
    }

    /// Create a notifier for the producing side. The notifier holds its
    /// own duplicate of the fd and may be passed to another process.
    pub fn notifier(&self) -> Result<ConditionNotifier> {
        let fd = rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?;
        Ok(ConditionNotifier { fd })
    }

    /// Consume any pending notifications without blocking.
    pub fn drain(&self) {
        let mut buf = [0u8; 8];
        let _ = rustix::io::read(&self.fd, &mut buf);
    }

    /// Block until notified. Pending notifications are consumed.
    pub fn wait(&self) -> Result<()> {
        loop {
            let mut buf = [0u8; 8];
            match rustix::io::read(&self.fd, &mut buf) {
                Ok(_) => return Ok(()),
                Err(rustix::io::Errno::AGAIN) => {}
                Err(e) => return Err(e.into()),
            }
            let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
            poll(&mut fds, -1)?;
        }
    }

    /// Block until notified or the timeout elapses (monotonic clock).
    ///
    /// Returns true if notified, false on timeout.
    pub fn timed_wait(&self, timeout: Duration) -> Result<bool> {
        let mut buf = [0u8; 8];
        match rustix::io::read(&self.fd, &mut buf) {
            Ok(_) => return Ok(true),
            Err(rustix::io::Errno::AGAIN) => {}
            Err(e) => return Err(e.into()),
        }
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
        let ready = poll(&mut fds, millis)?;
        if ready == 0 {
            return Ok(false);
        }
        self.drain();
        Ok(true)
    }
}

/// The producing side of a condition. Cloneable across processes by fd
/// duplication; notifying never blocks.
pub struct ConditionNotifier {
    fd: OwnedFd,
}

impl ConditionNotifier {
    /// Wake the waiter. A saturated counter means the waiter is already
    /// due to wake, so the notification is dropped.
    pub fn notify(&self) {
        let buf = 1u64.to_ne_bytes();
        match rustix::io::write(&self.fd, &buf) {
            Ok(_) => {}
            Err(rustix::io::Errno::AGAIN) => {}
            Err(e) => tracing::warn!(error = %e, "condition notify failed"),
        }
    }

    /// Duplicate this notifier.
    pub fn try_clone(&self) -> Result<Self> {
        let fd = rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?;
        Ok(Self { fd })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_wait_without_notify_times_out() {
        let condition = ConditionVariable::new().unwrap();
        assert!(!condition.timed_wait(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_notify_wakes_timed_wait() {
        let condition = ConditionVariable::new().unwrap();
        let notifier = condition.notifier().unwrap();
        notifier.notify();
        assert!(condition.timed_wait(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_notifications_collapse() {
        let condition = ConditionVariable::new().unwrap();
        let notifier = condition.notifier().unwrap();
        notifier.notify();
        notifier.notify();
        assert!(condition.timed_wait(Duration::from_millis(10)).unwrap());
        // Both notifies were consumed by the one wake.
        assert!(!condition.timed_wait(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_notify_from_thread_wakes_wait() {
        let condition = ConditionVariable::new().unwrap();
        let notifier = condition.notifier().unwrap();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });

        condition.wait().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_drain_clears_pending() {
        let condition = ConditionVariable::new().unwrap();
        let notifier = condition.notifier().unwrap();
        notifier.notify();
        condition.drain();
        assert!(!condition.timed_wait(Duration::from_millis(5)).unwrap());
    }
}
