//! Multiplexed event waiting: triggers and the WaitSet.

mod trigger;
#[allow(clippy::module_inception)]
mod waitset;

pub use trigger::{Trigger, TriggerInfo, TriggerPredicate, TriggerResetAction};
pub use waitset::{SubscriberEvent, SubscriberState, WaitSet};
