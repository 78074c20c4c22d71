//! The metaspace: one address range reserved at start-up and committed in chunks as class
//! loaders need them.
//!
//! Each class loader data owns a [`ClassLoaderMetaspace`], a bump allocator over the chunks
//! it has taken. Chunks go back to the [`Metaspace`] when the arena is dropped, which happens
//! when the loader is purged.

use super::CldIndex;
use crate::error::{ArchiveError, Result};
use crate::util::constants::METADATA_ALIGNMENT;
use crate::util::conversions::{bytes_to_formatted_string, raw_align_up};
use crate::util::memory::{self, MmapAnnotation, MmapProtection};
use crate::util::{Address, MemRange};
use std::sync::{Arc, Mutex};

pub struct Metaspace {
    reserved: MemRange,
    chunk_size: usize,
    sync: Mutex<MetaspaceSync>,
}

struct MetaspaceSync {
    /// Chunks below this index have been committed at least once.
    high_water: usize,
    /// Committed-then-released single chunks, ready for reuse.
    free_chunks: Vec<usize>,
    /// The owner of every chunk below `high_water`.
    owners: Vec<Option<CldIndex>>,
}

impl Metaspace {
    /// Reserve `reserve_size` bytes of address space for metadata.
    pub fn new(reserve_size: usize, chunk_size: usize) -> Result<Self> {
        let reserve_size = raw_align_up(reserve_size, chunk_size);
        let start = memory::reserve(None, reserve_size, &MmapAnnotation::Metaspace).map_err(|e| {
            error!("Unable to reserve metaspace: {}", e);
            ArchiveError::MetaspaceExhausted {
                requested: reserve_size,
            }
        })?;
        info!(
            "Reserved metaspace at {} ({})",
            start,
            bytes_to_formatted_string(reserve_size)
        );
        Ok(Metaspace {
            reserved: MemRange::new(start, reserve_size),
            chunk_size,
            sync: Mutex::new(MetaspaceSync {
                high_water: 0,
                free_chunks: vec![],
                owners: vec![],
            }),
        })
    }

    pub fn reserved(&self) -> MemRange {
        self.reserved
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.reserved.contains(addr)
    }

    fn chunk_index(&self, addr: Address) -> usize {
        (addr - self.reserved.start) / self.chunk_size
    }

    fn chunk_start(&self, index: usize) -> Address {
        self.reserved.start + index * self.chunk_size
    }

    /// Commit a chunk of at least `min_size` bytes for `owner`. The memory is zeroed.
    pub fn allocate_chunk(&self, owner: CldIndex, min_size: usize) -> Result<MemRange> {
        let n_chunks = raw_align_up(min_size.max(1), self.chunk_size) / self.chunk_size;
        let mut sync = self.sync.lock().unwrap_or_else(|e| e.into_inner());

        let first = match (n_chunks, sync.free_chunks.pop()) {
            (1, Some(index)) => index,
            (_, reuse) => {
                if let Some(index) = reuse {
                    sync.free_chunks.push(index);
                }
                let first = sync.high_water;
                if (first + n_chunks) * self.chunk_size > self.reserved.size {
                    warn!(
                        "Metaspace exhausted: {} committed, {} requested",
                        bytes_to_formatted_string(first * self.chunk_size),
                        bytes_to_formatted_string(min_size)
                    );
                    return Err(ArchiveError::MetaspaceExhausted { requested: min_size });
                }
                let high_water = first + n_chunks;
                sync.high_water = high_water;
                sync.owners.resize(high_water, None);
                first
            }
        };

        let chunk = MemRange::new(self.chunk_start(first), n_chunks * self.chunk_size);
        memory::dzmmap(
            chunk.start,
            chunk.size,
            MmapProtection::ReadWrite,
            &MmapAnnotation::Metaspace,
        )
        .map_err(|e| {
            error!("Unable to commit metaspace chunk {}: {}", chunk, e);
            ArchiveError::MetaspaceExhausted { requested: min_size }
        })?;
        for owner_slot in &mut sync.owners[first..first + n_chunks] {
            *owner_slot = Some(owner);
        }
        trace!("Metaspace chunk {} -> {}", chunk, owner);
        Ok(chunk)
    }

    /// Uncommit a chunk obtained from [`Metaspace::allocate_chunk`].
    pub fn release_chunk(&self, chunk: MemRange) {
        debug_assert!(self.reserved.contains_range(&chunk));
        if let Err(e) = memory::uncommit(chunk.start, chunk.size) {
            warn!("Unable to uncommit metaspace chunk {}: {}", chunk, e);
        }
        let mut sync = self.sync.lock().unwrap_or_else(|e| e.into_inner());
        let first = self.chunk_index(chunk.start);
        for index in first..first + chunk.size / self.chunk_size {
            sync.owners[index] = None;
            sync.free_chunks.push(index);
        }
        trace!("Metaspace chunk {} released", chunk);
    }

    /// The class loader data whose arena holds `addr`, if any.
    pub fn chunk_owner(&self, addr: Address) -> Option<CldIndex> {
        if !self.contains(addr) {
            return None;
        }
        let sync = self.sync.lock().unwrap_or_else(|e| e.into_inner());
        sync.owners.get(self.chunk_index(addr)).copied().flatten()
    }

    /// Number of chunks currently owned by some arena.
    pub fn committed_chunks(&self) -> usize {
        let sync = self.sync.lock().unwrap_or_else(|e| e.into_inner());
        sync.owners.iter().filter(|o| o.is_some()).count()
    }
}

impl Drop for Metaspace {
    fn drop(&mut self) {
        if let Err(e) = memory::munmap(self.reserved.start, self.reserved.size) {
            warn!("Unable to release metaspace {}: {}", self.reserved, e);
        }
    }
}

/// The metadata arena of one class loader data.
pub struct ClassLoaderMetaspace {
    owner: CldIndex,
    space: Arc<Metaspace>,
    chunks: Vec<MemRange>,
    cursor: Address,
    limit: Address,
    /// Blocks handed back with [`ClassLoaderMetaspace::deallocate`], reused first-fit.
    free_blocks: Vec<MemRange>,
    used: usize,
}

impl ClassLoaderMetaspace {
    pub fn new(space: Arc<Metaspace>, owner: CldIndex) -> Self {
        ClassLoaderMetaspace {
            owner,
            space,
            chunks: vec![],
            cursor: Address::ZERO,
            limit: Address::ZERO,
            free_blocks: vec![],
            used: 0,
        }
    }

    /// Allocate `size` zeroed bytes, aligned to the metadata alignment.
    pub fn allocate(&mut self, size: usize) -> Result<Address> {
        let size = raw_align_up(size.max(1), METADATA_ALIGNMENT);
        if let Some(addr) = self.allocate_from_free_blocks(size) {
            self.used += size;
            return Ok(addr);
        }
        let new_cursor = self.cursor + size;
        if self.cursor.is_zero() || new_cursor > self.limit {
            return self.allocate_slow(size);
        }
        let result = self.cursor;
        self.cursor = new_cursor;
        self.used += size;
        trace!("Metadata allocation size: {}, result: {}, owner: {}", size, result, self.owner);
        Ok(result)
    }

    fn allocate_slow(&mut self, size: usize) -> Result<Address> {
        let chunk = self.space.allocate_chunk(self.owner, size)?;
        // The tail of the old chunk stays usable for small requests.
        if !self.cursor.is_zero() && self.limit > self.cursor {
            self.free_blocks.push(MemRange::from_bounds(self.cursor, self.limit));
        }
        self.chunks.push(chunk);
        self.cursor = chunk.start;
        self.limit = chunk.end();
        self.allocate(size)
    }

    fn allocate_from_free_blocks(&mut self, size: usize) -> Option<Address> {
        let i = self.free_blocks.iter().position(|b| b.size >= size)?;
        let block = self.free_blocks[i];
        if block.size == size {
            self.free_blocks.swap_remove(i);
        } else {
            self.free_blocks[i] = MemRange::new(block.start + size, block.size - size);
        }
        // Reused blocks are handed out zeroed, like fresh ones.
        unsafe { std::ptr::write_bytes(block.start.to_mut_ptr::<u8>(), 0, size) };
        Some(block.start)
    }

    /// Return a block for reuse by later allocations of this arena.
    pub fn deallocate(&mut self, block: MemRange) {
        debug_assert!(self.contains(block.start));
        let size = raw_align_up(block.size.max(1), METADATA_ALIGNMENT);
        self.used = self.used.saturating_sub(size);
        self.free_blocks.push(MemRange::new(block.start, size));
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.chunks.iter().any(|c| c.contains(addr))
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }
}

impl Drop for ClassLoaderMetaspace {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.space.release_chunk(chunk);
        }
    }
}
