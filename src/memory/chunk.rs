//! Chunk header, chunk management record, and the shared-chunk handle.
//!
//! Every payload chunk starts with a [`ChunkHeader`]. Its bookkeeping
//! (the cross-process reference count and the back-pointers needed to
//! return the chunk) lives in a separate [`ChunkManagement`] record
//! allocated from a dedicated management pool, so payload slots stay
//! uniform and carry no metadata beyond the header.
//!
//! [`SharedChunk`] is the owning handle: cloning increments the shared
//! refcount, dropping decrements it, and the last drop returns the payload
//! chunk to its pool and then the management record to the management
//! pool, in that order.

use super::pool::{MemPool, PoolState};
use super::relative::{RelPtr, pack_chunk_ref, unpack_chunk_ref};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// User-facing metadata prepended to every chunk. The payload begins at
/// `payload_offset` bytes from the header start.
#[repr(C)]
#[derive(Debug)]
pub struct ChunkHeader {
    /// Requested payload size in bytes.
    pub payload_size: u64,
    /// Requested payload alignment in bytes.
    pub payload_alignment: u32,
    /// Byte offset from the header start to the payload.
    pub payload_offset: u32,
    /// Unique id of the publisher port that produced this chunk.
    pub originator_id: u64,
    /// Publisher-assigned sequence number, set at publish time.
    pub sequence_number: u64,
    /// Wall-clock timestamp in nanoseconds since the epoch, set at publish.
    pub timestamp_ns: u64,
}

impl ChunkHeader {
    /// Byte offset of the payload for the given alignment request.
    pub fn payload_offset_for(align: usize) -> usize {
        let header = std::mem::size_of::<ChunkHeader>();
        let align = align.max(std::mem::align_of::<ChunkHeader>());
        (header + align - 1) & !(align - 1)
    }

    /// Pointer to the payload.
    #[inline]
    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { (self as *const ChunkHeader as *mut u8).add(self.payload_offset as usize) }
    }
}

/// Shared-memory resident bookkeeping record, one per live chunk.
///
/// 72 bytes; the management pool uses 128-byte slots so the record always
/// fits regardless of pointer packing changes.
#[repr(C)]
pub struct ChunkManagement {
    /// Number of live [`SharedChunk`] handles plus queue slots holding
    /// this chunk.
    refcount: AtomicU64,
    /// Where this record itself lives, for packing into queue cells.
    self_ptr: RelPtr<ChunkManagement>,
    /// The chunk header inside the payload pool's slab.
    chunk_header: RelPtr<ChunkHeader>,
    /// Pool the payload chunk came from.
    payload_pool: RelPtr<PoolState>,
    /// Pool this record came from.
    mgmt_pool: RelPtr<PoolState>,
}

impl ChunkManagement {
    /// Create a record with an initial refcount of one.
    pub fn new(
        self_ptr: RelPtr<ChunkManagement>,
        chunk_header: RelPtr<ChunkHeader>,
        payload_pool: RelPtr<PoolState>,
        mgmt_pool: RelPtr<PoolState>,
    ) -> Self {
        Self {
            refcount: AtomicU64::new(1),
            self_ptr,
            chunk_header,
            payload_pool,
            mgmt_pool,
        }
    }
}

/// An owning, nullable reference to a chunk management record.
///
/// Constructing from a raw record transfers ownership of one refcount
/// contribution; `Clone` adds one; `Drop` removes one and releases the
/// chunk on zero.
pub struct SharedChunk {
    mgmt: Option<NonNull<ChunkManagement>>,
}

// SAFETY: the refcount is atomic and the pointee lives in shared memory
// that outlives all handles.
unsafe impl Send for SharedChunk {}
unsafe impl Sync for SharedChunk {}

impl SharedChunk {
    /// The empty handle.
    pub const fn null() -> Self {
        Self { mgmt: None }
    }

    /// Take ownership of one refcount contribution on `mgmt`.
    ///
    /// Does not modify the refcount: the caller's contribution (for a
    /// fresh record, the initial count of one) transfers to the handle.
    ///
    /// # Safety
    ///
    /// `mgmt` must point to an initialized `ChunkManagement` whose
    /// refcount includes the contribution being transferred.
    pub unsafe fn from_management(mgmt: NonNull<ChunkManagement>) -> Self {
        Self { mgmt: Some(mgmt) }
    }

    /// Returns true if this handle refers to a chunk.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.mgmt.is_some()
    }

    fn management(&self) -> Option<&ChunkManagement> {
        // SAFETY: mgmt points into a mapped segment for the handle's life.
        self.mgmt.map(|m| unsafe { &*m.as_ptr() })
    }

    /// The chunk header, or `None` for the empty handle.
    pub fn header(&self) -> Option<&ChunkHeader> {
        let mgmt = self.management()?;
        let header = mgmt.chunk_header.try_resolve()?;
        // SAFETY: the header was placement-initialized at allocation.
        Some(unsafe { &*header.as_ptr() })
    }

    /// Mutable access to the chunk header.
    ///
    /// Callers must hold the only handle (the loan phase); the transport
    /// itself only mutates headers before the chunk is published.
    pub fn header_mut(&mut self) -> Option<&mut ChunkHeader> {
        let mgmt = self.management()?;
        let header = mgmt.chunk_header.try_resolve()?;
        Some(unsafe { &mut *header.as_ptr() })
    }

    /// The payload bytes.
    pub fn payload(&self) -> Option<&[u8]> {
        let header = self.header()?;
        Some(unsafe {
            std::slice::from_raw_parts(header.payload_ptr(), header.payload_size as usize)
        })
    }

    /// Mutable payload bytes. Same exclusivity contract as
    /// [`header_mut`](Self::header_mut).
    pub fn payload_mut(&mut self) -> Option<&mut [u8]> {
        let header = self.header()?;
        Some(unsafe {
            std::slice::from_raw_parts_mut(header.payload_ptr(), header.payload_size as usize)
        })
    }

    /// Returns true if both handles refer to the same chunk.
    pub fn ptr_eq(&self, other: &SharedChunk) -> bool {
        match (self.mgmt, other.mgmt) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Current refcount, for tests and diagnostics.
    pub fn refcount(&self) -> u64 {
        self.management()
            .map(|m| m.refcount.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Pack this handle into a queue cell value, transferring its refcount
    /// contribution into the cell. Returns 0 for the empty handle.
    pub fn into_cell(self) -> u64 {
        let packed = match self.management() {
            Some(mgmt) => pack_chunk_ref(mgmt.self_ptr.segment(), mgmt.self_ptr.offset()),
            None => 0,
        };
        std::mem::forget(self);
        packed
    }

    /// Reconstruct a handle from a queue cell value, taking over the
    /// refcount contribution the cell held.
    ///
    /// Returns the empty handle for cell value 0 or an unmapped segment
    /// (the latter is logged: it means a contribution is leaked).
    pub fn from_cell(cell: u64) -> Self {
        if cell == 0 {
            return Self::null();
        }
        let (segment, offset) = unpack_chunk_ref(cell);
        let rel: RelPtr<ChunkManagement> = RelPtr::new(segment, offset);
        match rel.try_resolve() {
            Some(mgmt) => Self { mgmt: Some(mgmt) },
            None => {
                tracing::error!(
                    segment = segment.0,
                    offset,
                    "chunk cell refers to unmapped segment; refcount contribution leaked"
                );
                Self::null()
            }
        }
    }
}

impl Clone for SharedChunk {
    fn clone(&self) -> Self {
        if let Some(mgmt) = self.management() {
            let old = mgmt.refcount.fetch_add(1, Ordering::AcqRel);
            if old > i64::MAX as u64 {
                mgmt.refcount.fetch_sub(1, Ordering::AcqRel);
                panic!("shared chunk refcount overflow");
            }
        }
        Self { mgmt: self.mgmt }
    }
}

impl Drop for SharedChunk {
    fn drop(&mut self) {
        let Some(mgmt_ptr) = self.mgmt else {
            return;
        };
        let mgmt = unsafe { &*mgmt_ptr.as_ptr() };
        let old = mgmt.refcount.fetch_sub(1, Ordering::AcqRel);
        if old == 0 {
            // Double release. The count is now corrupt; treat as fatal.
            tracing::error!("shared chunk refcount underflow; memory corruption");
            panic!("shared chunk refcount underflow");
        }
        if old != 1 {
            return;
        }

        // Last reference: return the payload chunk first, then the record.
        let header = mgmt.chunk_header;
        let payload_pool = mgmt.payload_pool;
        let mgmt_pool = mgmt.mgmt_pool;

        match (MemPool::from_rel(payload_pool), header.try_resolve()) {
            (Some(pool), Some(header_ptr)) => pool.release_chunk(header_ptr.cast::<u8>()),
            _ => {
                tracing::error!("payload pool unmapped on final release; chunk leaked");
                return;
            }
        }
        match MemPool::from_rel(mgmt_pool) {
            Some(pool) => pool.release_chunk(mgmt_ptr.cast::<u8>()),
            None => {
                tracing::error!("management pool unmapped on final release; record leaked")
            }
        }
    }
}

impl Default for SharedChunk {
    fn default() -> Self {
        Self::null()
    }
}

impl std::fmt::Debug for SharedChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.header() {
            Some(header) => f
                .debug_struct("SharedChunk")
                .field("payload_size", &header.payload_size)
                .field("sequence", &header.sequence_number)
                .field("refcount", &self.refcount())
                .finish(),
            None => f.write_str("SharedChunk(null)"),
        }
    }
}
