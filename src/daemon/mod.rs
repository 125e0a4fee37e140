//! Building blocks for the discovery daemon: the runtime wire protocol,
//! per-process liveness tokens, and the port registry that owns the
//! publisher/subscriber matching relation.

mod liveness;
mod protocol;
mod registry;

pub use liveness::{LivenessToken, is_process_alive};
pub use protocol::{
    DaemonReply, RuntimeRequest, frame_reply, frame_request, unframe_reply, unframe_request,
};
pub use registry::PortRegistry;
