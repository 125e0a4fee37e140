//! WaitSet: block one thread on events from many subscriber ports.
//!
//! Attaching installs a condition notifier on the port's queue and stores
//! a [`Trigger`] whose predicate is re-evaluated after every wake, so
//! collapsed notifications and spurious wakeups are harmless. Detaching
//! or dropping the WaitSet runs each trigger's reset action, which tears
//! the port-side attachment down again.

use super::trigger::{Trigger, TriggerInfo};
use crate::config::MAX_TRIGGERS;
use crate::error::{Error, Result};
use crate::port::SubscriberPort;
use crate::sync::{ConditionNotifier, ConditionVariable};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Subscriber states a WaitSet can watch (level-triggered).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberState {
    /// The subscriber's queue holds at least one sample.
    HasData,
}

/// Subscriber events a WaitSet can watch (edge-triggered).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberEvent {
    /// A sample was delivered since the last wait.
    DataReceived,
}

/// Multiplexed blocking wait over up to [`MAX_TRIGGERS`] triggers.
pub struct WaitSet {
    condition: ConditionVariable,
    /// Wakes our own `wait` when triggers are detached mid-wait.
    self_notifier: ConditionNotifier,
    triggers: Mutex<Vec<Trigger>>,
}

impl WaitSet {
    /// Create an empty WaitSet.
    pub fn new() -> Result<Self> {
        let condition = ConditionVariable::new()?;
        let self_notifier = condition.notifier()?;
        Ok(Self {
            condition,
            self_notifier,
            triggers: Mutex::new(Vec::new()),
        })
    }

    /// Watch a subscriber state (level-triggered): the trigger fires as
    /// long as the state holds.
    ///
    /// Returns the trigger's unique id. Fails with
    /// [`Error::ConditionAlreadySet`] if the port is already attached to a
    /// WaitSet and [`Error::ResourceExhausted`] when the trigger table is
    /// full.
    pub fn attach_state(
        &self,
        subscriber: &SubscriberPort,
        state: SubscriberState,
        trigger_id: u64,
    ) -> Result<u64> {
        let SubscriberState::HasData = state;

        let queue = Arc::clone(subscriber.queue());
        let predicate_queue = Arc::clone(&queue);
        self.attach(
            subscriber,
            trigger_id,
            Arc::new(move || !predicate_queue.is_empty()),
            Box::new(move |_| queue.detach_condition()),
            None,
        )
    }

    /// Watch a subscriber event (edge-triggered): the trigger fires once
    /// per delivery, consumed by the wait that observes it.
    ///
    /// The edge flag is process-local; cross-process WaitSets should use
    /// [`attach_state`](Self::attach_state).
    pub fn attach_event(
        &self,
        subscriber: &SubscriberPort,
        event: SubscriberEvent,
        trigger_id: u64,
    ) -> Result<u64> {
        let SubscriberEvent::DataReceived = event;

        let queue = Arc::clone(subscriber.queue());
        let flag = Arc::new(AtomicBool::new(false));
        let predicate_flag = Arc::clone(&flag);
        let reset_queue = Arc::clone(&queue);
        self.attach(
            subscriber,
            trigger_id,
            Arc::new(move || predicate_flag.swap(false, Ordering::AcqRel)),
            Box::new(move |_| {
                reset_queue.detach_condition();
                reset_queue.detach_event_flag();
            }),
            Some(flag),
        )
    }

    fn attach(
        &self,
        subscriber: &SubscriberPort,
        trigger_id: u64,
        predicate: super::trigger::TriggerPredicate,
        reset: super::trigger::TriggerResetAction,
        event_flag: Option<Arc<AtomicBool>>,
    ) -> Result<u64> {
        let mut triggers = self.triggers.lock().expect("trigger table poisoned");
        if triggers.len() >= MAX_TRIGGERS {
            return Err(Error::ResourceExhausted(format!(
                "trigger table full ({} triggers)",
                MAX_TRIGGERS
            )));
        }

        subscriber.queue().attach_condition(self.condition.notifier()?)?;
        if let Some(flag) = event_flag {
            subscriber.queue().attach_event_flag(flag);
        }

        let trigger = Trigger::new(
            TriggerInfo {
                origin: subscriber as *const SubscriberPort as usize,
                trigger_id,
            },
            predicate,
            reset,
        );
        let unique_id = trigger.unique_id();
        triggers.push(trigger);
        Ok(unique_id)
    }

    /// Detach by unique id, running the trigger's reset action. Returns
    /// true if a trigger was removed.
    pub fn detach(&self, unique_id: u64) -> bool {
        let mut triggers = self.triggers.lock().expect("trigger table poisoned");
        let before = triggers.len();
        triggers.retain(|t| t.unique_id() != unique_id);
        let removed = triggers.len() != before;
        drop(triggers);
        if removed {
            // A waiter blocked on the removed trigger must re-evaluate.
            self.self_notifier.notify();
        }
        removed
    }

    /// Invalidate every trigger carrying the given user trigger id and
    /// wake a blocked `wait`.
    pub fn mark_for_destruction(&self, trigger_id: u64) {
        let mut triggers = self.triggers.lock().expect("trigger table poisoned");
        triggers.retain_mut(|t| {
            if t.info().trigger_id == trigger_id {
                t.reset();
                false
            } else {
                true
            }
        });
        drop(triggers);
        self.self_notifier.notify();
    }

    /// Number of attached triggers.
    pub fn trigger_count(&self) -> usize {
        self.triggers.lock().expect("trigger table poisoned").len()
    }

    fn fired(&self) -> Vec<TriggerInfo> {
        let triggers = self.triggers.lock().expect("trigger table poisoned");
        triggers
            .iter()
            .filter(|t| t.has_triggered())
            .map(|t| t.info())
            .collect()
    }

    fn any_valid(&self) -> bool {
        let triggers = self.triggers.lock().expect("trigger table poisoned");
        triggers.iter().any(|t| t.is_valid())
    }

    /// Block until at least one trigger fires. Returns the fired
    /// triggers' infos, or an empty list once no valid trigger remains.
    pub fn wait(&self) -> Vec<TriggerInfo> {
        loop {
            let fired = self.fired();
            if !fired.is_empty() {
                return fired;
            }
            if !self.any_valid() {
                return Vec::new();
            }
            if let Err(e) = self.condition.wait() {
                tracing::warn!(error = %e, "waitset wait failed");
                return Vec::new();
            }
        }
    }

    /// Like [`wait`](Self::wait), but additionally returns an empty list
    /// once `timeout` has elapsed (monotonic clock).
    pub fn timed_wait(&self, timeout: Duration) -> Vec<TriggerInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            let fired = self.fired();
            if !fired.is_empty() {
                return fired;
            }
            if !self.any_valid() {
                return Vec::new();
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
            else {
                return Vec::new();
            };
            match self.condition.timed_wait(remaining) {
                Ok(true) => {}
                Ok(false) => return Vec::new(),
                Err(e) => {
                    tracing::warn!(error = %e, "waitset timed wait failed");
                    return Vec::new();
                }
            }
        }
    }
}

impl Drop for WaitSet {
    fn drop(&mut self) {
        // Each trigger's drop runs its reset action, detaching the ports.
        self.triggers
            .lock()
            .expect("trigger table poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, RuntimeConfig};
    use crate::memory::MemoryManager;
    use crate::port::{ServiceDescription, SubscriberOptions};

    fn setup() -> (Arc<MemoryManager>, SubscriberPort) {
        let config = RuntimeConfig::new("waitset-test", vec![PoolConfig::new(128, 16)]);
        let manager = Arc::new(MemoryManager::create(&config).unwrap());
        let subscriber = SubscriberPort::new(
            ServiceDescription::new("lidar", "roof", "points"),
            SubscriberOptions::default(),
        )
        .unwrap();
        (manager, subscriber)
    }

    #[test]
    fn test_timed_wait_empty_waitset_times_out() {
        let waitset = WaitSet::new().unwrap();
        let fired = waitset.timed_wait(Duration::from_millis(5));
        assert!(fired.is_empty());
    }

    #[test]
    fn test_state_trigger_fires_on_push() {
        let (manager, subscriber) = setup();
        let waitset = WaitSet::new().unwrap();
        waitset
            .attach_state(&subscriber, SubscriberState::HasData, 11)
            .unwrap();

        let entry = subscriber.queue_entry();
        entry.pusher.push(manager.get_chunk(16, 8).unwrap()).unwrap();

        let fired = waitset.timed_wait(Duration::from_millis(100));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].trigger_id, 11);

        // Level-triggered: still firing while data is queued.
        let fired = waitset.timed_wait(Duration::from_millis(10));
        assert_eq!(fired.len(), 1);

        subscriber.release_queued_data();
        let fired = waitset.timed_wait(Duration::from_millis(10));
        assert!(fired.is_empty());
    }

    #[test]
    fn test_event_trigger_fires_once_per_delivery() {
        let (manager, subscriber) = setup();
        let waitset = WaitSet::new().unwrap();
        waitset
            .attach_event(&subscriber, SubscriberEvent::DataReceived, 3)
            .unwrap();

        let entry = subscriber.queue_entry();
        entry.pusher.push(manager.get_chunk(16, 8).unwrap()).unwrap();

        let fired = waitset.timed_wait(Duration::from_millis(100));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].trigger_id, 3);

        // Edge-triggered: consumed even though the sample is still queued.
        let fired = waitset.timed_wait(Duration::from_millis(10));
        assert!(fired.is_empty());
        subscriber.release_queued_data();
    }

    #[test]
    fn test_wait_wakes_from_another_thread() {
        let (manager, subscriber) = setup();
        let waitset = WaitSet::new().unwrap();
        waitset
            .attach_state(&subscriber, SubscriberState::HasData, 1)
            .unwrap();

        let entry = subscriber.queue_entry();
        let pusher_manager = Arc::clone(&manager);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            entry
                .pusher
                .push(pusher_manager.get_chunk(16, 8).unwrap())
                .unwrap();
        });

        let fired = waitset.wait();
        assert_eq!(fired.len(), 1);
        handle.join().unwrap();
        subscriber.release_queued_data();
    }

    #[test]
    fn test_double_attach_same_port_fails() {
        let (_manager, subscriber) = setup();
        let waitset = WaitSet::new().unwrap();
        waitset
            .attach_state(&subscriber, SubscriberState::HasData, 1)
            .unwrap();
        assert!(matches!(
            waitset.attach_state(&subscriber, SubscriberState::HasData, 2),
            Err(Error::ConditionAlreadySet)
        ));
    }

    #[test]
    fn test_detach_reattaches_cleanly() {
        let (_manager, subscriber) = setup();
        let waitset = WaitSet::new().unwrap();
        let id = waitset
            .attach_state(&subscriber, SubscriberState::HasData, 1)
            .unwrap();

        assert!(waitset.detach(id));
        assert!(!waitset.detach(id));
        assert_eq!(waitset.trigger_count(), 0);

        // The reset action detached the port's notifier slot.
        waitset
            .attach_state(&subscriber, SubscriberState::HasData, 2)
            .unwrap();
    }

    #[test]
    fn test_mark_for_destruction_cancels_wait() {
        let (_manager, subscriber) = setup();
        let waitset = Arc::new(WaitSet::new().unwrap());
        waitset
            .attach_state(&subscriber, SubscriberState::HasData, 9)
            .unwrap();

        let canceller = Arc::clone(&waitset);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.mark_for_destruction(9);
        });

        // No data ever arrives; the cancellation must end the wait.
        let fired = waitset.wait();
        assert!(fired.is_empty());
        assert_eq!(waitset.trigger_count(), 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_drop_detaches_ports() {
        let (_manager, subscriber) = setup();
        {
            let waitset = WaitSet::new().unwrap();
            waitset
                .attach_state(&subscriber, SubscriberState::HasData, 1)
                .unwrap();
        }
        // The WaitSet is gone; the port can be attached to a new one.
        let waitset = WaitSet::new().unwrap();
        waitset
            .attach_state(&subscriber, SubscriberState::HasData, 1)
            .unwrap();
    }
}
