//! Wire protocol between runtime processes and the discovery daemon.
//!
//! Messages are serialized with rkyv and sent over Unix sockets with
//! length-prefixed framing. Truncated input is reported as "incomplete"
//! (`Ok(None)`), malformed frames as an explicit protocol error; a frame
//! never panics the daemon.

use crate::error::{Error, Result};
use crate::port::ServiceDescription;

/// Upper bound on a single frame. Anything larger is a corrupt length
/// prefix, not a real message.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Request sent from a runtime process to the daemon.
#[derive(Clone, Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum RuntimeRequest {
    /// Announce this process and its liveness token.
    ///
    /// First message on every connection.
    RegRuntime {
        /// Runtime process name, unique per host.
        name: String,
    },

    /// Request creation of a publisher port.
    ReqPublisher {
        /// Service the publisher offers.
        service: ServiceDescription,
        /// History samples to retain for late joiners.
        history_capacity: u64,
    },

    /// Request creation of a subscriber port.
    ReqSubscriber {
        /// Service the subscriber wants.
        service: ServiceDescription,
        /// Receiver queue capacity.
        queue_capacity: u64,
    },

    /// Start offering a publisher port.
    Offer {
        /// Port id returned by `ReqPublisher`.
        port: u64,
    },

    /// Stop offering a publisher port.
    StopOffer {
        /// Port id returned by `ReqPublisher`.
        port: u64,
    },

    /// Subscribe a subscriber port.
    Subscribe {
        /// Port id returned by `ReqSubscriber`.
        port: u64,
        /// Historical samples requested on connect.
        history_req: u64,
    },

    /// Unsubscribe a subscriber port.
    Unsubscribe {
        /// Port id returned by `ReqSubscriber`.
        port: u64,
    },

    /// Liveness probe.
    Ping {
        /// Sequence number echoed in the `Pong`.
        seq: u64,
    },
}

/// Reply sent from the daemon to a runtime process.
#[derive(Clone, Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum DaemonReply {
    /// A port was created.
    PortCreated {
        /// The new port's unique id.
        port: u64,
        /// Segment holding the port's shared state.
        segment: u16,
        /// Offset of the port's state within the segment.
        offset: u64,
    },

    /// The request was applied.
    Ack,

    /// Liveness response.
    Pong {
        /// Sequence number from the `Ping`.
        seq: u64,
    },

    /// The request failed.
    Error {
        /// Stable error code.
        code: u32,
        /// Human-readable message.
        message: String,
    },
}

fn frame<T>(msg: &T) -> Result<Vec<u8>>
where
    T: for<'a> rkyv::Serialize<
        rkyv::api::high::HighSerializer<
            rkyv::util::AlignedVec,
            rkyv::ser::allocator::ArenaHandle<'a>,
            rkyv::rancor::Error,
        >,
    >,
{
    let serialized = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| Error::Protocol(format!("serialization failed: {e}")))?;
    let len = serialized.len() as u32;

    let mut framed = Vec::with_capacity(4 + serialized.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&serialized);
    Ok(framed)
}

fn unframe_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame length {} exceeds limit {}",
            len, MAX_FRAME_LEN
        )));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    Ok(Some(len))
}

/// Frame a request for sending.
pub fn frame_request(msg: &RuntimeRequest) -> Result<Vec<u8>> {
    frame(msg)
}

/// Frame a reply for sending.
pub fn frame_reply(msg: &DaemonReply) -> Result<Vec<u8>> {
    frame(msg)
}

/// Unframe a request.
///
/// Returns `Ok(None)` while the buffer holds no complete frame, and the
/// message plus the number of consumed bytes once it does.
pub fn unframe_request(buf: &[u8]) -> Result<Option<(RuntimeRequest, usize)>> {
    let Some(len) = unframe_len(buf)? else {
        return Ok(None);
    };

    let mut aligned = rkyv::util::AlignedVec::<8>::new();
    aligned.extend_from_slice(&buf[4..4 + len]);
    let msg = rkyv::from_bytes::<RuntimeRequest, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Protocol(format!("malformed request: {e}")))?;
    Ok(Some((msg, 4 + len)))
}

/// Unframe a reply. Same contract as [`unframe_request`].
pub fn unframe_reply(buf: &[u8]) -> Result<Option<(DaemonReply, usize)>> {
    let Some(len) = unframe_len(buf)? else {
        return Ok(None);
    };

    let mut aligned = rkyv::util::AlignedVec::<8>::new();
    aligned.extend_from_slice(&buf[4..4 + len]);
    let msg = rkyv::from_bytes::<DaemonReply, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Protocol(format!("malformed reply: {e}")))?;
    Ok(Some((msg, 4 + len)))
}
