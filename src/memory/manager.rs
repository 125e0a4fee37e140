//! Memory manager: the configured payload pools plus the management pool,
//! laid out in one shared memory segment.

use super::chunk::{ChunkHeader, ChunkManagement, SharedChunk};
use super::pool::MemPool;
use super::relative::RelPtr;
use super::segment::{BumpAllocator, SharedMemorySegment};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use std::ptr::NonNull;

/// Slot size of the management pool. One uniform size for all payload
/// classes; a [`ChunkManagement`] record occupies 72 of these bytes.
const MGMT_CHUNK_SIZE: usize = 128;

/// Owns the shared memory segment and hands out [`SharedChunk`]s from the
/// smallest size class that fits a request.
pub struct MemoryManager {
    segment: SharedMemorySegment,
    /// Payload pools, ascending by chunk size.
    pools: Vec<MemPool>,
    /// Management records, one slot per payload chunk in any pool.
    mgmt_pool: MemPool,
}

impl MemoryManager {
    /// Create the segment and carve all pools out of it.
    pub fn create(config: &RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let mgmt_count = config.total_chunk_count();
        let mut total = 0usize;
        for pool in &config.pools {
            // State block + links + slab, plus slack for slab alignment.
            total += 64 + pool.chunk_count * 4 + pool.chunk_count * pool.chunk_size;
            total += 2 * pool.chunk_size.max(64);
        }
        total += 64 + mgmt_count * 4 + mgmt_count * MGMT_CHUNK_SIZE + 2 * MGMT_CHUNK_SIZE;

        let name = format!("axon-{}", config.name);
        let segment = SharedMemorySegment::create(&name, total)?;
        let mut alloc =
            BumpAllocator::new(NonNull::new(segment.as_ptr()).unwrap(), segment.len());

        let mut pools = Vec::with_capacity(config.pools.len());
        for pool in &config.pools {
            pools.push(MemPool::create(
                &segment,
                &mut alloc,
                pool.chunk_size,
                pool.chunk_count,
            )?);
        }
        let mgmt_pool = MemPool::create(&segment, &mut alloc, MGMT_CHUNK_SIZE, mgmt_count)?;

        tracing::debug!(
            runtime = %config.name,
            segment_bytes = segment.len(),
            pools = pools.len(),
            "memory manager initialized"
        );

        Ok(Self {
            segment,
            pools,
            mgmt_pool,
        })
    }

    /// Allocate a chunk whose payload holds `payload_size` bytes at
    /// `payload_alignment`, construct its header in place, and return the
    /// owning handle.
    pub fn get_chunk(&self, payload_size: usize, payload_alignment: usize) -> Result<SharedChunk> {
        if payload_alignment == 0 || !payload_alignment.is_power_of_two() {
            return Err(Error::AllocationFailed(format!(
                "payload alignment {} is not a power of two",
                payload_alignment
            )));
        }

        let payload_offset = ChunkHeader::payload_offset_for(payload_alignment);
        let required = payload_offset + payload_size;

        let pool = self
            .pools
            .iter()
            .find(|p| p.chunk_size() >= required)
            .ok_or_else(|| {
                Error::AllocationFailed(format!(
                    "no pool fits {} bytes (payload {} align {})",
                    required, payload_size, payload_alignment
                ))
            })?;

        let chunk = pool.get_chunk().ok_or_else(|| {
            tracing::warn!(
                chunk_size = pool.chunk_size(),
                "memory pool exhausted"
            );
            Error::AllocationFailed(format!(
                "pool with chunk size {} exhausted",
                pool.chunk_size()
            ))
        })?;

        let Some(mgmt_slot) = self.mgmt_pool.get_chunk() else {
            pool.release_chunk(chunk);
            return Err(Error::AllocationFailed(
                "management pool exhausted".into(),
            ));
        };

        // SAFETY: both slots are freshly allocated, exclusively owned, and
        // large enough (validated pool sizing) for in-place construction.
        unsafe {
            let header_ptr = chunk.as_ptr() as *mut ChunkHeader;
            header_ptr.write(ChunkHeader {
                payload_size: payload_size as u64,
                payload_alignment: payload_alignment as u32,
                payload_offset: payload_offset as u32,
                originator_id: 0,
                sequence_number: 0,
                timestamp_ns: 0,
            });

            let mgmt_ptr = mgmt_slot.as_ptr() as *mut ChunkManagement;
            mgmt_ptr.write(ChunkManagement::new(
                RelPtr::new(self.segment.id(), self.segment.offset_of(mgmt_slot.as_ptr())),
                RelPtr::new(self.segment.id(), self.segment.offset_of(chunk.as_ptr())),
                pool.rel_ptr(),
                self.mgmt_pool.rel_ptr(),
            ));

            Ok(SharedChunk::from_management(NonNull::new_unchecked(mgmt_ptr)))
        }
    }

    /// The backing segment.
    pub fn segment(&self) -> &SharedMemorySegment {
        &self.segment
    }

    /// The payload pools, ascending by chunk size.
    pub fn pools(&self) -> &[MemPool] {
        &self.pools
    }

    /// Chunks currently allocated across all payload pools.
    pub fn total_in_use(&self) -> usize {
        self.pools.iter().map(|p| p.in_use()).sum()
    }

    /// Management records currently allocated.
    pub fn mgmt_in_use(&self) -> usize {
        self.mgmt_pool.in_use()
    }
}
