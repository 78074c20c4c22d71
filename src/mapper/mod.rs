//! Mapping a validated archive into the process.
//!
//! The metadata regions of an archive are mapped back to back into one reservation at the
//! address they were laid out for. The static archive and a dynamic archive on top of it
//! form one contiguous [`SharedRange`], so "is this metadata shared" is a single range check.

mod heap;

pub use self::heap::{compute_relocation, has_heap_regions, patch_heap_region, HeapRelocation, MappedHeap};

use crate::archive::catalog::{self, CatalogEntry, SerializedRoot, STUB_SIZE};
use crate::archive::format::{FileMapHeader, RegionKind};
use crate::archive::path_table::SharedPathTable;
use crate::archive::FileMapInfo;
use crate::error::{ArchiveError, Result};
use crate::util::conversions::raw_align_up;
use crate::util::memory::{self, MmapAnnotation, MmapProtection};
use crate::util::options::Options;
use crate::util::safepoint::SafepointGuard;
use crate::util::{Address, MemRange};
use crate::vm::{ArchiveHeap, VMEnvironment};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// The address range covered by mapped archive metadata.
#[derive(Default)]
pub struct SharedRange {
    base: AtomicUsize,
    top: AtomicUsize,
}

impl SharedRange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, range: MemRange) {
        self.top.store(0, Ordering::Release);
        self.base.store(range.start.as_usize(), Ordering::Release);
        self.top.store(range.end().as_usize(), Ordering::Release);
    }

    /// Grow the range to `top`. The range must currently end where the new layer starts.
    pub fn extend_to(&self, layer: MemRange) -> Result<()> {
        self.top
            .compare_exchange(
                layer.start.as_usize(),
                layer.end().as_usize(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| ArchiveError::BaseArchiveMismatch("layer is not adjacent to the shared range".into()))
    }

    /// Shrink the range back to `top`.
    pub fn shrink_to(&self, top: Address) {
        self.top.store(top.as_usize(), Ordering::Release);
    }

    pub fn clear(&self) {
        self.top.store(0, Ordering::Release);
        self.base.store(0, Ordering::Release);
    }

    pub fn contains(&self, addr: Address) -> bool {
        let top = self.top.load(Ordering::Acquire);
        let base = self.base.load(Ordering::Acquire);
        base <= addr.as_usize() && addr.as_usize() < top
    }

    pub fn range(&self) -> MemRange {
        let top = self.top.load(Ordering::Acquire);
        let base = self.base.load(Ordering::Acquire);
        if top <= base {
            MemRange::EMPTY
        } else {
            unsafe { MemRange::from_bounds(Address::from_usize(base), Address::from_usize(top)) }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.range().is_empty()
    }
}

/// The mapping address of every metadata region when mapped at `base`: region `i` starts at
/// `base` plus the aligned sizes of the regions before it.
pub fn region_bases(header: &FileMapHeader, base: Address) -> [Address; 4] {
    let alignment = header.alignment as usize;
    let mut cursor = base;
    let mut bases = [Address::ZERO; 4];
    for (i, kind) in RegionKind::NON_HEAP.iter().enumerate() {
        bases[i] = cursor;
        cursor = cursor + raw_align_up(header.region(*kind).used(), alignment);
    }
    bases
}

/// The byte range `offset..offset + len`, if it fits in a region of `limit` bytes.
fn subrange(offset: u64, len: u64, limit: usize) -> Option<std::ops::Range<usize>> {
    let end = offset.checked_add(len)?;
    if end > limit as u64 {
        return None;
    }
    Some(offset as usize..end as usize)
}

/// One archive layer mapped into the process.
///
/// Dropping it undoes everything [`MappedArchive::map`] did: the range is withdrawn, the
/// metadata regions are unmapped and the heap ranges are handed back to the collector.
pub struct MappedArchive {
    info: FileMapInfo,
    reserved: MemRange,
    heap: Arc<dyn ArchiveHeap>,
    range: Arc<SharedRange>,
    published: bool,
    mapped_heap: MappedHeap,
    path_table: SharedPathTable,
    catalog: Vec<CatalogEntry>,
    ro_writable: AtomicBool,
}

impl MappedArchive {
    /// Map `info`, whose header has been validated.
    ///
    /// A static archive starts the shared range; a dynamic one must start where the range
    /// currently ends. On any error everything mapped so far is released.
    pub fn map(
        info: FileMapInfo,
        options: &Options,
        env: &VMEnvironment,
        heap: Arc<dyn ArchiveHeap>,
        range: Arc<SharedRange>,
    ) -> Result<Self> {
        let header = info.header();
        let base = header.mapped_base_address;
        let size = header.non_heap_size();
        if size == 0 {
            return Err(ArchiveError::CorruptedData("archive has no metadata regions"));
        }
        let start = memory::reserve_at(base, size, &MmapAnnotation::SharedSpace).map_err(|e| {
            debug!("{}", memory::get_process_memory_maps().unwrap_or_default());
            ArchiveError::ReserveFailed {
                requested: base,
                size,
                reason: e.to_string(),
            }
        })?;
        info!("Reserved archive space at {} ({} bytes)", start, size);

        let mut archive = MappedArchive {
            info,
            reserved: MemRange::new(start, size),
            heap,
            range,
            published: false,
            mapped_heap: MappedHeap::default(),
            path_table: SharedPathTable::default(),
            catalog: vec![],
            ro_writable: AtomicBool::new(false),
        };
        archive.map_metadata_regions()?;
        archive.publish()?;
        archive.load_path_table(options)?;
        archive.load_catalog()?;
        if archive.header().is_static() {
            archive.mapped_heap = heap::map_heap_regions(&archive.info, &*archive.heap, env);
        }
        Ok(archive)
    }

    fn map_metadata_regions(&mut self) -> Result<()> {
        let header = self.info.header();
        let bases = region_bases(header, self.reserved.start);
        for (kind, expected) in RegionKind::NON_HEAP.iter().zip(bases) {
            let region = header.region(*kind);
            if region.mapped_base() != expected {
                error!(
                    "Region {} must be mapped at {} to be contiguous, but was laid out at {}",
                    kind,
                    expected,
                    region.mapped_base()
                );
                return Err(ArchiveError::CorruptedData("metadata regions are not contiguous"));
            }
            if region.is_empty() {
                continue;
            }
            memory::map_file_at(
                self.info.file(),
                region.file_offset,
                expected,
                region.used(),
                MmapProtection::for_region(region.read_only, region.allow_exec),
                &MmapAnnotation::Region { name: &kind.to_string() },
            )
            .map_err(|e| ArchiveError::MapFailed {
                region: *kind,
                addr: expected,
                reason: e.to_string(),
            })?;
            self.info
                .verify_region_checksum(*kind, unsafe { expected.as_bytes(region.used()) })?;
            debug!("Mapped region {} at {} ({} bytes)", kind, expected, region.used());
        }
        #[cfg(feature = "extreme_assertions")]
        {
            let top = bases[3] + raw_align_up(header.region(RegionKind::Md).used(), header.alignment as usize);
            assert_eq!(top, self.reserved.end());
        }
        Ok(())
    }

    fn publish(&mut self) -> Result<()> {
        if self.header().is_static() {
            self.range.set(self.reserved);
        } else {
            self.range.extend_to(self.reserved)?;
        }
        self.published = true;
        Ok(())
    }

    fn load_path_table(&mut self, options: &Options) -> Result<()> {
        let header = self.info.header();
        let rw = self.region_bytes(RegionKind::Rw);
        let table_bytes = subrange(header.shared_path_table_offset, header.shared_path_table_size, rw.len())
            .map(|r| &rw[r])
            .ok_or(ArchiveError::CorruptedData("shared path table out of range"))?;
        let mut table = SharedPathTable::deserialize(
            table_bytes,
            header.app_class_paths_start_index,
            header.app_module_paths_start_index,
            header.num_module_paths,
        )?;
        if table.len() != header.num_shared_paths as usize {
            return Err(ArchiveError::CorruptedData("shared path table size mismatch"));
        }
        table.validate(header.max_used_path_index, options.print_shared_archive_and_exit)?;
        self.path_table = table;
        Ok(())
    }

    fn load_catalog(&mut self) -> Result<()> {
        let header = self.info.header();
        let md = self.region_bytes(RegionKind::Md);
        let root_bytes = subrange(header.serialized_data_offset, SerializedRoot::SIZE as u64, md.len())
            .map(|r| &md[r])
            .ok_or(ArchiveError::CorruptedData("serialized root out of range"))?;
        let root = SerializedRoot::read(root_bytes)?;

        let out_of_range = || ArchiveError::CorruptedData("class catalog out of range");
        let ro = self.region_bytes(RegionKind::Ro);
        let catalog_range = subrange(root.catalog_offset, root.catalog_size, ro.len()).ok_or_else(out_of_range)?;
        let stubs_size = root
            .class_count
            .checked_mul(STUB_SIZE as u64)
            .ok_or_else(out_of_range)?;
        let stubs = subrange(
            root.stub_table_offset,
            stubs_size,
            self.region_bytes(RegionKind::Mc).len(),
        )
        .ok_or_else(out_of_range)?;
        let catalog = catalog::parse_catalog(
            &ro[catalog_range.clone()],
            self.region_range(RegionKind::Ro).start + catalog_range.start,
            self.region_range(RegionKind::Mc).start + stubs.start,
        )?;
        if catalog.len() as u64 != root.class_count {
            return Err(ArchiveError::CorruptedData("class count mismatch"));
        }
        debug!("{} archived classes in {}", catalog.len(), self.info.path().display());
        self.catalog = catalog;
        Ok(())
    }

    pub fn info(&self) -> &FileMapInfo {
        &self.info
    }

    pub fn header(&self) -> &FileMapHeader {
        self.info.header()
    }

    /// The range holding this layer's metadata regions.
    pub fn mapped_range(&self) -> MemRange {
        self.reserved
    }

    /// Where a metadata region is mapped.
    pub fn region_range(&self, kind: RegionKind) -> MemRange {
        debug_assert!(!kind.is_heap());
        let region = self.header().region(kind);
        MemRange::new(region.mapped_base(), region.used())
    }

    /// The mapped bytes of a metadata region.
    pub fn region_bytes(&self, kind: RegionKind) -> &[u8] {
        let range = self.region_range(kind);
        if range.is_empty() {
            return &[];
        }
        // The mapping lives as long as `self`.
        unsafe { range.start.as_bytes(range.size) }
    }

    pub fn path_table(&self) -> &SharedPathTable {
        &self.path_table
    }

    pub fn catalog(&self) -> &[CatalogEntry] {
        &self.catalog
    }

    pub fn mapped_heap(&self) -> &MappedHeap {
        &self.mapped_heap
    }

    pub fn is_read_only_region_writable(&self) -> bool {
        self.ro_writable.load(Ordering::Acquire)
    }

    /// Replace the read-only region with a private writable mapping of the same bytes, so
    /// that archived classes can be redefined. Mutators must be stopped.
    pub fn remap_shared_readonly_as_readwrite(&self, _safepoint: &SafepointGuard) -> Result<()> {
        let region = *self.header().region(RegionKind::Ro);
        if !region.read_only || region.is_empty() || self.is_read_only_region_writable() {
            return Ok(());
        }
        memory::map_file_at(
            self.info.file(),
            region.file_offset,
            region.mapped_base(),
            region.used(),
            MmapProtection::ReadWrite,
            &MmapAnnotation::Region { name: "ro" },
        )
        .map_err(|e| ArchiveError::MapFailed {
            region: RegionKind::Ro,
            addr: region.mapped_base(),
            reason: e.to_string(),
        })?;
        self.ro_writable.store(true, Ordering::Release);
        info!("Remapped shared readonly space as readwrite at {}", region.mapped_base());
        Ok(())
    }
}

impl Drop for MappedArchive {
    fn drop(&mut self) {
        if self.published {
            if self.header().is_static() {
                self.range.clear();
            } else {
                self.range.shrink_to(self.reserved.start);
            }
        }
        if let Err(e) = memory::munmap(self.reserved.start, self.reserved.size) {
            warn!("Unable to unmap archive space {}: {}", self.reserved, e);
        }
        self.mapped_heap.release(&*self.heap);
        debug!("Unmapped {}", self.info.path().display());
    }
}

impl std::fmt::Debug for MappedArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedArchive")
            .field("info", &self.info)
            .field("reserved", &self.reserved)
            .field("heap", &self.mapped_heap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::format::ArchiveKind;

    fn addr(v: usize) -> Address {
        unsafe { Address::from_usize(v) }
    }

    #[test]
    fn region_bases_are_cumulative_aligned_sizes() {
        let mut header = FileMapHeader::new(ArchiveKind::Static, "x");
        header.alignment = 0x1000;
        let sizes = [0x10, 0x2345, 0, 0x1000];
        for (kind, size) in RegionKind::NON_HEAP.iter().zip(sizes) {
            header.region_mut(*kind).used = size;
        }
        let base = addr(0x8_0000_0000);
        let bases = region_bases(&header, base);
        assert_eq!(bases[0], base);
        assert_eq!(bases[1], base + 0x1000usize);
        assert_eq!(bases[2], base + 0x4000usize);
        assert_eq!(bases[3], base + 0x4000usize);
        assert_eq!(header.non_heap_size(), 0x5000);
    }

    #[test]
    fn subrange_rejects_overflow() {
        assert_eq!(subrange(8, 16, 24), Some(8..24));
        assert_eq!(subrange(8, 17, 24), None);
        assert_eq!(subrange(8, u64::MAX, 24), None);
        assert_eq!(subrange(u64::MAX, 1, usize::MAX), None);
    }

    #[test]
    fn shared_range_layers() {
        let range = SharedRange::new();
        assert!(!range.contains(addr(0x1000)));
        range.set(MemRange::new(addr(0x10_0000), 0x1000));
        assert!(range.contains(addr(0x10_0000)));
        assert!(!range.contains(addr(0x10_1000)));
        assert!(range.extend_to(MemRange::new(addr(0x20_0000), 0x1000)).is_err());
        range.extend_to(MemRange::new(addr(0x10_1000), 0x1000)).unwrap();
        assert!(range.contains(addr(0x10_1fff)));
        range.shrink_to(addr(0x10_1000));
        assert!(!range.contains(addr(0x10_1000)));
        range.clear();
        assert!(range.is_empty());
    }
}
