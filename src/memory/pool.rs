//! Fixed-size-class memory pool over a shared memory slab.
//!
//! The free list is a Treiber stack of slot indices. The stack head packs a
//! 32-bit generation counter with the 32-bit head index into a single
//! 64-bit CAS word, so a slot that is popped, reused, and pushed again
//! cannot be mistaken for the original (ABA protection). Allocation and
//! release are lock-free MPMC and work from any process that has the
//! segment mapped.
//!
//! All pool state lives in shared memory ([`PoolState`]); [`MemPool`] is
//! the cheap per-process handle over it.

use super::relative::RelPtr;
use super::segment::{BumpAllocator, SharedMemorySegment};
use crate::error::Result;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic value identifying an initialized pool.
const POOL_MAGIC: u64 = 0x41584f4e_504f4f4c; // "AXONPOOL"

/// Index value marking the end of the free list.
const FREE_SENTINEL: u32 = u32::MAX;

const INDEX_MASK: u64 = 0xffff_ffff;

#[inline]
fn pack_head(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[inline]
fn head_index(word: u64) -> u32 {
    (word & INDEX_MASK) as u32
}

#[inline]
fn head_generation(word: u64) -> u32 {
    (word >> 32) as u32
}

/// Shared-memory resident pool state.
///
/// Followed in memory by the `next` link array (one `AtomicU32` per slot)
/// and the chunk slab, at the offsets recorded here.
#[repr(C, align(64))]
pub struct PoolState {
    magic: u64,
    chunk_size: u64,
    chunk_count: u64,
    /// Byte offset from `self` to the next-link array.
    next_offset: u64,
    /// Byte offset from `self` to the first chunk.
    slab_offset: u64,
    /// Packed (generation, head index) word of the free stack.
    free_head: AtomicU64,
    /// Chunks currently allocated out of the pool.
    in_use: AtomicU64,
}

/// Per-process handle to a [`PoolState`].
#[derive(Clone, Copy)]
pub struct MemPool {
    state: NonNull<PoolState>,
    rel: RelPtr<PoolState>,
}

// SAFETY: all mutable pool state is behind atomics in shared memory.
unsafe impl Send for MemPool {}
unsafe impl Sync for MemPool {}

impl MemPool {
    /// Carve a new pool out of `segment` via `alloc` and initialize it with
    /// every slot free.
    ///
    /// `chunk_size` must be a power of two; the slab is aligned to it so
    /// every chunk is naturally aligned to its own size.
    pub fn create(
        segment: &SharedMemorySegment,
        alloc: &mut BumpAllocator,
        chunk_size: usize,
        chunk_count: usize,
    ) -> Result<Self> {
        debug_assert!(chunk_size.is_power_of_two());
        debug_assert!(chunk_count > 0 && (chunk_count as u64) < FREE_SENTINEL as u64);

        let state_size = std::mem::size_of::<PoolState>();
        let next_offset = state_size; // PoolState is 64-aligned, links need 4
        let links_end = next_offset + chunk_count * std::mem::size_of::<AtomicU32>();
        let slab_offset = (links_end + chunk_size - 1) & !(chunk_size - 1);
        let total = slab_offset + chunk_count * chunk_size;

        let base = alloc.allocate(total, chunk_size.max(64))?;
        let state_ptr = base.cast::<PoolState>();

        // SAFETY: base points to `total` zeroed, exclusively owned bytes.
        unsafe {
            state_ptr.as_ptr().write(PoolState {
                magic: POOL_MAGIC,
                chunk_size: chunk_size as u64,
                chunk_count: chunk_count as u64,
                next_offset: next_offset as u64,
                slab_offset: slab_offset as u64,
                free_head: AtomicU64::new(pack_head(0, 0)),
                in_use: AtomicU64::new(0),
            });

            // Thread every slot onto the free stack: i -> i + 1, last -> end.
            let links = base.as_ptr().add(next_offset) as *mut AtomicU32;
            for i in 0..chunk_count {
                let next = if i + 1 == chunk_count {
                    FREE_SENTINEL
                } else {
                    (i + 1) as u32
                };
                (*links.add(i)).store(next, Ordering::Relaxed);
            }
        }

        let rel = RelPtr::new(segment.id(), segment.offset_of(base.as_ptr()));
        Ok(Self {
            state: state_ptr,
            rel,
        })
    }

    /// Re-create a handle from a relative pointer stored in shared memory.
    ///
    /// Returns `None` if the segment is not mapped in this process or the
    /// pointee is not an initialized pool.
    pub fn from_rel(rel: RelPtr<PoolState>) -> Option<Self> {
        let state = rel.try_resolve()?;
        // SAFETY: resolve checked the bounds; magic guards interpretation.
        if unsafe { state.as_ref() }.magic != POOL_MAGIC {
            return None;
        }
        Some(Self { state, rel })
    }

    /// Relative pointer to this pool's state, storable in shared memory.
    #[inline]
    pub fn rel_ptr(&self) -> RelPtr<PoolState> {
        self.rel
    }

    #[inline]
    fn state(&self) -> &PoolState {
        // SAFETY: the segment mapping outlives every handle by the
        // shared-resource policy (no unmap while handles are live).
        unsafe { self.state.as_ref() }
    }

    #[inline]
    fn next_slot(&self, index: u32) -> &AtomicU32 {
        let state = self.state();
        debug_assert!((index as u64) < state.chunk_count);
        unsafe {
            let links = (self.state.as_ptr() as *const u8).add(state.next_offset as usize)
                as *const AtomicU32;
            &*links.add(index as usize)
        }
    }

    #[inline]
    fn slab_base(&self) -> *mut u8 {
        unsafe { (self.state.as_ptr() as *mut u8).add(self.state().slab_offset as usize) }
    }

    /// Size of each chunk in bytes.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.state().chunk_size as usize
    }

    /// Total number of chunks.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.state().chunk_count as usize
    }

    /// Chunks currently allocated.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.state().in_use.load(Ordering::Relaxed) as usize
    }

    /// Pop a free chunk, or `None` if the pool is exhausted. Lock-free.
    pub fn get_chunk(&self) -> Option<NonNull<u8>> {
        let state = self.state();
        loop {
            let head = state.free_head.load(Ordering::Acquire);
            let index = head_index(head);
            if index == FREE_SENTINEL {
                return None;
            }
            let next = self.next_slot(index).load(Ordering::Relaxed);
            let tagged = pack_head(head_generation(head).wrapping_add(1), next);
            match state.free_head.compare_exchange_weak(
                head,
                tagged,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    state.in_use.fetch_add(1, Ordering::Relaxed);
                    let ptr = unsafe {
                        self.slab_base().add(index as usize * state.chunk_size as usize)
                    };
                    return NonNull::new(ptr);
                }
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    /// Push a chunk back onto the free stack. Lock-free.
    ///
    /// Must be called exactly once per `get_chunk`.
    ///
    /// # Panics
    ///
    /// Panics if `chunk` does not lie on a slot boundary inside this
    /// pool's slab; that indicates memory corruption.
    pub fn release_chunk(&self, chunk: NonNull<u8>) {
        let state = self.state();
        let index = self.index_of(chunk);

        loop {
            let head = state.free_head.load(Ordering::Acquire);
            self.next_slot(index).store(head_index(head), Ordering::Relaxed);
            let tagged = pack_head(head_generation(head).wrapping_add(1), index);
            match state.free_head.compare_exchange_weak(
                head,
                tagged,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    state.in_use.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    /// Returns true if `ptr` points into this pool's slab.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let state = self.state();
        let base = self.slab_base() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= base && addr < base + (state.chunk_count * state.chunk_size) as usize
    }

    fn index_of(&self, chunk: NonNull<u8>) -> u32 {
        let state = self.state();
        assert!(self.contains(chunk), "chunk pointer outside pool slab");
        let delta = chunk.as_ptr() as usize - self.slab_base() as usize;
        assert!(
            delta % state.chunk_size as usize == 0,
            "chunk pointer not on a slot boundary"
        );
        (delta / state.chunk_size as usize) as u32
    }
}

impl std::fmt::Debug for MemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPool")
            .field("chunk_size", &self.chunk_size())
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}
