//! Shared memory segments backed by Linux memfd.
//!
//! A segment is a contiguous region of anonymous shared memory created via
//! `memfd_create` and mapped read/write. It can be shared with another
//! process by passing its file descriptor over a Unix socket with
//! `SCM_RIGHTS`. Because each process maps the segment at a different base
//! address, everything stored *inside* a segment references other in-segment
//! data by `(segment id, offset)` pairs; the process-local registry in this
//! module resolves a segment id to the local base address.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::collections::HashMap;
use std::ffi::CString;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{OnceLock, RwLock};

/// Identifier of a shared memory segment, agreed between processes.
///
/// The creating process assigns the id; receivers register their mapping
/// under the same id so relative pointers resolve identically everywhere.
/// Id 0 is reserved as "invalid".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub u16);

impl SegmentId {
    /// The reserved invalid id.
    pub const INVALID: SegmentId = SegmentId(0);

    /// Returns true if this id refers to a real segment.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// Process-local table mapping segment ids to their local mappings.
struct SegmentTable {
    entries: HashMap<u16, (usize, usize)>, // id -> (base, len)
}

static SEGMENTS: OnceLock<RwLock<SegmentTable>> = OnceLock::new();
static NEXT_SEGMENT_ID: AtomicU16 = AtomicU16::new(1);

fn table() -> &'static RwLock<SegmentTable> {
    SEGMENTS.get_or_init(|| {
        RwLock::new(SegmentTable {
            entries: HashMap::new(),
        })
    })
}

/// Allocate a fresh, process-unique segment id.
fn next_segment_id() -> SegmentId {
    SegmentId(NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Register a mapping under `id`. Fails if the id is already registered
/// to a different base.
fn register(id: SegmentId, base: usize, len: usize) -> Result<()> {
    let mut guard = table().write().expect("segment table poisoned");
    if let Some(&(existing_base, _)) = guard.entries.get(&id.0) {
        if existing_base != base {
            return Err(Error::InvalidSegment(format!(
                "segment id {} already registered at a different base",
                id.0
            )));
        }
        return Ok(());
    }
    guard.entries.insert(id.0, (base, len));
    Ok(())
}

fn deregister(id: SegmentId) {
    let mut guard = table().write().expect("segment table poisoned");
    guard.entries.remove(&id.0);
}

/// Resolve a segment id to its local (base address, length).
///
/// Returns `None` if the segment is not mapped in this process.
pub fn resolve_segment(id: SegmentId) -> Option<(usize, usize)> {
    let guard = table().read().expect("segment table poisoned");
    guard.entries.get(&id.0).copied()
}

/// A shared memory segment backed by Linux memfd.
///
/// The creating side uses [`SharedMemorySegment::create`]; a receiving
/// process maps the fd it got over a Unix socket with
/// [`SharedMemorySegment::from_fd`], passing the creator's segment id so
/// relative pointers stored inside the segment resolve.
pub struct SharedMemorySegment {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
    id: SegmentId,
    name: Option<String>,
}

impl SharedMemorySegment {
    /// Create a new shared memory segment and register it.
    ///
    /// # Errors
    ///
    /// Returns an error if `memfd_create`, `ftruncate`, or `mmap` fails.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidSegment("size must be greater than 0".into()));
        }

        let cname = CString::new(name).map_err(|e| Error::InvalidSegment(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::InvalidSegment("mmap returned null".into()))?;

        let id = next_segment_id();
        register(id, ptr.as_ptr() as usize, size)?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            id,
            name: Some(name.to_string()),
        })
    }

    /// Map an existing segment from a received file descriptor and register
    /// it under the id communicated by the creator.
    ///
    /// # Safety
    ///
    /// The caller must ensure `fd` is a valid memfd of at least `size`
    /// bytes, and that `id` is the id the creating process assigned.
    pub unsafe fn from_fd(fd: OwnedFd, size: usize, id: SegmentId) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidSegment("size must be greater than 0".into()));
        }
        if !id.is_valid() {
            return Err(Error::InvalidSegment("segment id 0 is reserved".into()));
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::InvalidSegment("mmap returned null".into()))?;

        register(id, ptr.as_ptr() as usize, size)?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            id,
            name: None,
        })
    }

    /// The segment id relative pointers into this segment carry.
    #[inline]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Base pointer of the local mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Total size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the segment has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of `ptr` from the segment base.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not lie within the segment.
    pub fn offset_of(&self, ptr: *const u8) -> u64 {
        let base = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        assert!(
            addr >= base && addr < base + self.len,
            "pointer outside segment"
        );
        (addr - base) as u64
    }

    /// The file descriptor, for sharing via `SCM_RIGHTS`.
    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// The raw file descriptor.
    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Debug name, if created locally.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        deregister(self.id);
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is valid for the lifetime of the segment and all
// mutable state inside it is accessed through atomics.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Init-time placement allocator over a segment.
///
/// Pools and queue states are carved out of the segment once at startup;
/// there is no deallocation. Not thread-safe; use before publishing the
/// segment to other threads.
pub struct BumpAllocator {
    base: NonNull<u8>,
    len: usize,
    cursor: usize,
}

impl BumpAllocator {
    /// Create an allocator over `[base, base + len)`.
    pub fn new(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base,
            len,
            cursor: 0,
        }
    }

    /// Allocate `size` bytes aligned to `align` (power of two).
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let start = (self.cursor + align - 1) & !(align - 1);
        let end = start
            .checked_add(size)
            .ok_or_else(|| Error::AllocationFailed("placement overflow".into()))?;
        if end > self.len {
            return Err(Error::AllocationFailed(format!(
                "segment too small: need {} more bytes",
                end - self.len
            )));
        }
        self.cursor = end;
        // SAFETY: start < len, base is non-null.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) })
    }

    /// Bytes handed out so far (including alignment padding).
    pub fn used(&self) -> usize {
        self.cursor
    }
}

/// Send a segment's fd plus its `(id, size)` metadata over a Unix socket.
///
/// The receiving process calls [`recv_segment`] and then maps the fd with
/// [`SharedMemorySegment::from_fd`].
pub fn send_segment(socket: &UnixStream, segment: &SharedMemorySegment) -> Result<()> {
    let mut payload = [0u8; 10];
    payload[..2].copy_from_slice(&segment.id().0.to_le_bytes());
    payload[2..].copy_from_slice(&(segment.len() as u64).to_le_bytes());

    let fds = [segment.fd()];
    let mut space = [0u8; 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut space);
    if !ancillary.push(SendAncillaryMessage::ScmRights(&fds)) {
        return Err(Error::InvalidSegment(
            "failed to add fd to ancillary buffer".into(),
        ));
    }

    let iov = [IoSlice::new(&payload)];
    sendmsg(socket, &iov, &mut ancillary, SendFlags::empty())?;
    Ok(())
}

/// Receive a segment fd and its `(id, size)` metadata from a Unix socket.
pub fn recv_segment(socket: &UnixStream) -> Result<(OwnedFd, SegmentId, usize)> {
    let mut payload = [0u8; 10];
    let mut space = [0u8; 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut space);

    let mut iov = [IoSliceMut::new(&mut payload)];
    let result = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::empty())?;
    if result.bytes != payload.len() {
        return Err(Error::InvalidSegment(format!(
            "expected {} metadata bytes, got {}",
            payload.len(),
            result.bytes
        )));
    }

    let mut fds = Vec::new();
    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            fds.extend(rights);
        }
    }
    if fds.len() != 1 {
        return Err(Error::InvalidSegment(format!(
            "expected 1 fd, got {}",
            fds.len()
        )));
    }

    let id = SegmentId(u16::from_le_bytes([payload[0], payload[1]]));
    let size = u64::from_le_bytes(payload[2..].try_into().unwrap()) as usize;
    Ok((fds.pop().unwrap(), id, size))
}
