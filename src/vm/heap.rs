use crate::util::MemRange;

/// The hooks a garbage-collected heap exposes so that archived heap regions can be mapped
/// into it.
///
/// The mapper never owns heap memory. It asks the collector to check and carve out the exact
/// ranges the archive needs, maps the file over them, and hands them back through
/// [`ArchiveHeap::dealloc_archive_ranges`] if anything goes wrong.
pub trait ArchiveHeap: Send + Sync {
    /// Can this heap host archived regions at all? If not, heap regions are never mapped.
    fn supports_archive_heap(&self) -> bool;

    /// The address range reserved for the heap.
    fn reserved_range(&self) -> MemRange;

    /// The collector's region size. The bottom of the closed archive regions is placed on a
    /// boundary of this size.
    fn region_granularity(&self) -> usize;

    /// Do all `ranges` lie within the reserved heap?
    fn check_archive_ranges(&self, ranges: &[MemRange]) -> bool;

    /// Allocate exactly `ranges` from the heap. `open` regions may later be written by the
    /// collector; closed ones are never written.
    fn alloc_archive_ranges(&self, ranges: &[MemRange], open: bool) -> bool;

    /// Give back ranges obtained with [`ArchiveHeap::alloc_archive_ranges`].
    fn dealloc_archive_ranges(&self, ranges: &[MemRange], open: bool);

    /// Make freshly mapped ranges parseable by the heap's iteration machinery.
    fn fill_archive_regions(&self, ranges: &[MemRange], open: bool);
}

/// A heap that does not support archived regions.
#[derive(Default)]
pub struct NoArchiveHeap;

impl ArchiveHeap for NoArchiveHeap {
    fn supports_archive_heap(&self) -> bool {
        false
    }
    fn reserved_range(&self) -> MemRange {
        MemRange::EMPTY
    }
    fn region_granularity(&self) -> usize {
        crate::util::constants::BYTES_IN_PAGE
    }
    fn check_archive_ranges(&self, _ranges: &[MemRange]) -> bool {
        false
    }
    fn alloc_archive_ranges(&self, _ranges: &[MemRange], _open: bool) -> bool {
        false
    }
    fn dealloc_archive_ranges(&self, _ranges: &[MemRange], _open: bool) {}
    fn fill_archive_regions(&self, _ranges: &[MemRange], _open: bool) {}
}
