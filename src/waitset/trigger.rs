//! Triggers: the predicate/reset pairs a WaitSet multiplexes over.
//!
//! A trigger is a plain value: a "has triggered" predicate, a one-shot
//! reset action run when the trigger dies, and an identity (origin
//! pointer plus user-supplied trigger id). No trait objects beyond the
//! two callbacks; equality of predicates is `Arc` identity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TRIGGER_ID: AtomicU64 = AtomicU64::new(0);

/// Predicate invoked by `has_triggered`.
pub type TriggerPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// One-shot action run when the trigger is reset, receiving the trigger's
/// unique id. Detaches whatever the attachment installed on the port.
pub type TriggerResetAction = Box<dyn FnOnce(u64) + Send>;

/// Identity of a trigger: where it was attached and the id the user chose.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerInfo {
    /// Address of the attached port, used as an opaque origin token.
    pub origin: usize,
    /// User-supplied trigger id, reported back from `wait`.
    pub trigger_id: u64,
}

/// A single entry in a WaitSet.
///
/// Valid while its predicate is set; invalidation is idempotent. Dropping
/// a trigger resets it, so the port-side attachment never outlives the
/// trigger.
pub struct Trigger {
    unique_id: u64,
    predicate: Option<TriggerPredicate>,
    reset: Option<TriggerResetAction>,
    info: TriggerInfo,
}

impl Trigger {
    /// Create a valid trigger.
    pub fn new(
        info: TriggerInfo,
        predicate: TriggerPredicate,
        reset: TriggerResetAction,
    ) -> Self {
        Self {
            unique_id: NEXT_TRIGGER_ID.fetch_add(1, Ordering::Relaxed),
            predicate: Some(predicate),
            reset: Some(reset),
            info,
        }
    }

    /// Globally unique id of this trigger instance.
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    /// The trigger's identity.
    pub fn info(&self) -> TriggerInfo {
        self.info
    }

    /// A trigger is valid while its predicate is set.
    pub fn is_valid(&self) -> bool {
        self.predicate.is_some()
    }

    /// Evaluate the predicate. Invalid triggers never fire.
    pub fn has_triggered(&self) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(),
            None => false,
        }
    }

    /// Run the reset action once and invalidate. Safe to call repeatedly.
    pub fn reset(&mut self) {
        if !self.is_valid() {
            return;
        }
        if let Some(reset) = self.reset.take() {
            reset(self.unique_id);
        }
        self.invalidate();
    }

    /// Drop the predicate without running the reset action. Idempotent.
    pub fn invalidate(&mut self) {
        self.predicate = None;
    }

    /// Two triggers are logically equal iff both are valid, share the
    /// origin and user trigger id, and hold the identical predicate.
    pub fn is_logical_equal_to(&self, other: &Trigger) -> bool {
        let (Some(a), Some(b)) = (&self.predicate, &other.predicate) else {
            return false;
        };
        self.info.origin == other.info.origin
            && self.info.trigger_id == other.info.trigger_id
            && Arc::ptr_eq(a, b)
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        self.reset();
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("unique_id", &self.unique_id)
            .field("trigger_id", &self.info.trigger_id)
            .field("valid", &self.is_valid())
            .finish()
    }
}
