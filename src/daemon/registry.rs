//! Daemon-side port registry: matching, connection bookkeeping, and
//! crash cleanup.
//!
//! The registry owns the matching relation between publishers and
//! subscribers; it is the sole mutator of distributor membership. Ports
//! request transitions (`offer`, `subscribe`, …) and the registry's
//! sweep applies them in causal order per port, confirming back into the
//! port state machines.

use super::liveness::is_process_alive;
use crate::config::{MAX_PUBLISHERS, MAX_SUBSCRIBERS};
use crate::error::{Error, Result};
use crate::port::{PublisherPort, SubscribeState, SubscriberPort, UniquePortId};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

struct PublisherEntry {
    port: Arc<PublisherPort>,
    runtime: String,
}

struct SubscriberEntry {
    port: Arc<SubscriberPort>,
    runtime: String,
}

struct ProcessEntry {
    name: String,
    token_path: PathBuf,
}

/// The daemon's view of every port on the host.
pub struct PortRegistry {
    publishers: Mutex<Vec<PublisherEntry>>,
    subscribers: Mutex<Vec<SubscriberEntry>>,
    processes: Mutex<Vec<ProcessEntry>>,
}

impl PortRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            publishers: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
        }
    }

    /// Register a runtime process and its liveness token.
    pub fn register_process(&self, name: impl Into<String>, token_path: PathBuf) {
        let name = name.into();
        tracing::info!(runtime = %name, "runtime registered");
        self.processes
            .lock()
            .expect("process table poisoned")
            .push(ProcessEntry { name, token_path });
    }

    /// Register a publisher port owned by `runtime`.
    pub fn register_publisher(&self, port: Arc<PublisherPort>, runtime: &str) -> Result<()> {
        let mut publishers = self.publishers.lock().expect("publisher table poisoned");
        if publishers.len() >= MAX_PUBLISHERS {
            return Err(Error::ResourceExhausted(format!(
                "publisher table full ({} ports)",
                MAX_PUBLISHERS
            )));
        }
        tracing::debug!(service = %port.service(), port = %port.id(), "publisher registered");
        publishers.push(PublisherEntry {
            port,
            runtime: runtime.into(),
        });
        Ok(())
    }

    /// Register a subscriber port owned by `runtime`.
    pub fn register_subscriber(&self, port: Arc<SubscriberPort>, runtime: &str) -> Result<()> {
        let mut subscribers = self.subscribers.lock().expect("subscriber table poisoned");
        if subscribers.len() >= MAX_SUBSCRIBERS {
            return Err(Error::ResourceExhausted(format!(
                "subscriber table full ({} ports)",
                MAX_SUBSCRIBERS
            )));
        }
        tracing::debug!(service = %port.service(), port = %port.id(), "subscriber registered");
        subscribers.push(SubscriberEntry {
            port,
            runtime: runtime.into(),
        });
        Ok(())
    }

    /// Remove a publisher port, demoting its subscribers back to waiting
    /// for a match.
    pub fn unregister_publisher(&self, id: UniquePortId) {
        let removed = {
            let mut publishers = self.publishers.lock().expect("publisher table poisoned");
            let index = publishers.iter().position(|e| e.port.id() == id);
            index.map(|i| publishers.swap_remove(i))
        };
        if let Some(entry) = removed {
            self.orphan_subscribers_of(&entry.port);
        }
    }

    /// Remove a subscriber port, detaching its queue everywhere.
    pub fn unregister_subscriber(&self, id: UniquePortId) {
        let removed = {
            let mut subscribers = self.subscribers.lock().expect("subscriber table poisoned");
            let index = subscribers.iter().position(|e| e.port.id() == id);
            index.map(|i| subscribers.swap_remove(i))
        };
        if removed.is_some() {
            let publishers = self.snapshot_publishers();
            for publisher in publishers {
                publisher.disconnect_subscriber(id);
            }
        }
    }

    /// Number of registered publishers.
    pub fn publisher_count(&self) -> usize {
        self.publishers.lock().expect("publisher table poisoned").len()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber table poisoned")
            .len()
    }

    fn snapshot_publishers(&self) -> Vec<Arc<PublisherPort>> {
        self.publishers
            .lock()
            .expect("publisher table poisoned")
            .iter()
            .map(|e| Arc::clone(&e.port))
            .collect()
    }

    fn snapshot_subscribers(&self) -> Vec<Arc<SubscriberPort>> {
        self.subscribers
            .lock()
            .expect("subscriber table poisoned")
            .iter()
            .map(|e| Arc::clone(&e.port))
            .collect()
    }

    /// One matching sweep: connect requested subscriptions to offered
    /// publishers, complete unsubscriptions, and demote subscribers whose
    /// publisher stopped offering. Run after every state-changing request
    /// (or periodically).
    pub fn process_matches(&self) {
        let publishers = self.snapshot_publishers();
        let subscribers = self.snapshot_subscribers();

        for subscriber in &subscribers {
            match subscriber.state() {
                SubscribeState::SubscribeRequested => {
                    let matched = publishers
                        .iter()
                        .find(|p| p.is_offered() && p.service() == subscriber.service());
                    if let Some(publisher) = matched {
                        match publisher.connect_subscriber(subscriber.queue_entry()) {
                            Ok(()) => subscriber.confirm_subscription(),
                            Err(e) => tracing::warn!(
                                service = %subscriber.service(),
                                error = %e,
                                "subscriber connection failed"
                            ),
                        }
                    }
                }
                SubscribeState::UnsubscribeRequested => {
                    for publisher in publishers
                        .iter()
                        .filter(|p| p.service() == subscriber.service())
                    {
                        publisher.disconnect_subscriber(subscriber.id());
                    }
                    subscriber.confirm_unsubscription();
                }
                SubscribeState::Subscribed => {
                    // A publisher that stopped offering sheds its queues;
                    // the subscriber waits for the next match.
                    for publisher in publishers
                        .iter()
                        .filter(|p| !p.is_offered() && p.service() == subscriber.service())
                    {
                        if publisher.disconnect_subscriber(subscriber.id()) {
                            subscriber.demote_to_requested();
                        }
                    }
                }
                SubscribeState::NotSubscribed => {}
            }
        }
    }

    /// Remove every port belonging to a process whose liveness token has
    /// been released, draining its outstanding loans and queues so no
    /// refcount contribution outlives the crash.
    ///
    /// Returns the number of dead processes cleaned up.
    pub fn cleanup_dead_processes(&self) -> usize {
        let dead: Vec<String> = {
            let processes = self.processes.lock().expect("process table poisoned");
            processes
                .iter()
                .filter(|p| !is_process_alive(&p.token_path))
                .map(|p| p.name.clone())
                .collect()
        };

        for runtime in &dead {
            tracing::warn!(runtime = %runtime, "dead process detected, fencing its ports");

            let dead_publishers: Vec<Arc<PublisherPort>> = {
                let mut publishers =
                    self.publishers.lock().expect("publisher table poisoned");
                let (gone, kept): (Vec<_>, Vec<_>) =
                    publishers.drain(..).partition(|e| &e.runtime == runtime);
                *publishers = kept;
                gone.into_iter().map(|e| e.port).collect()
            };
            for publisher in &dead_publishers {
                publisher.stop_offer();
                publisher.release_all();
                self.orphan_subscribers_of(publisher);
            }

            let dead_subscribers: Vec<Arc<SubscriberPort>> = {
                let mut subscribers =
                    self.subscribers.lock().expect("subscriber table poisoned");
                let (gone, kept): (Vec<_>, Vec<_>) =
                    subscribers.drain(..).partition(|e| &e.runtime == runtime);
                *subscribers = kept;
                gone.into_iter().map(|e| e.port).collect()
            };
            let publishers = self.snapshot_publishers();
            for subscriber in &dead_subscribers {
                for publisher in &publishers {
                    publisher.disconnect_subscriber(subscriber.id());
                }
                // Orphaned refcount contributions sitting in the queue.
                subscriber.release_queued_data();
            }

            self.processes
                .lock()
                .expect("process table poisoned")
                .retain(|p| &p.name != runtime);
        }

        dead.len()
    }

    fn orphan_subscribers_of(&self, publisher: &PublisherPort) {
        let subscribers = self.snapshot_subscribers();
        for subscriber in subscribers {
            if subscriber.service() == publisher.service()
                && subscriber.state() == SubscribeState::Subscribed
            {
                publisher.disconnect_subscriber(subscriber.id());
                subscriber.demote_to_requested();
            }
        }
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}
