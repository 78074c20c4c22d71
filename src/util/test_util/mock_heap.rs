//! A heap for tests: a real anonymous reservation that hands out archive ranges and records
//! what the mapper asked of it.

use crate::util::memory::{self, MmapProtection};
use crate::util::{Address, MemRange};
use crate::vm::ArchiveHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub struct MockHeap {
    mapping: MemRange,
    reserved: MemRange,
    granularity: usize,
    supported: bool,
    refuse_open: AtomicBool,
    allocated: Mutex<Vec<(MemRange, bool)>>,
    filled: Mutex<Vec<(MemRange, bool)>>,
}

impl MockHeap {
    /// A committed heap of `size` bytes whose start is aligned to `granularity`.
    pub fn new(size: usize, granularity: usize) -> Self {
        let total = size + granularity;
        let mapping_start = memory::reserve(None, total, mmap_anno_test!()).expect("Unable to reserve mock heap");
        let start = mapping_start.align_up(granularity);
        memory::dzmmap(start, size, MmapProtection::ReadWrite, mmap_anno_test!()).expect("Unable to commit mock heap");
        MockHeap {
            mapping: MemRange::new(mapping_start, total),
            reserved: MemRange::new(start, size),
            granularity,
            supported: true,
            refuse_open: AtomicBool::new(false),
            allocated: Mutex::default(),
            filled: Mutex::default(),
        }
    }

    /// A heap that refuses archived regions.
    pub fn unsupported(size: usize, granularity: usize) -> Self {
        let mut heap = Self::new(size, granularity);
        heap.supported = false;
        heap
    }

    /// Make every later allocation of open ranges fail.
    pub fn refuse_open_ranges(&self) {
        self.refuse_open.store(true, Ordering::SeqCst);
    }

    pub fn start(&self) -> Address {
        self.reserved.start
    }

    pub fn end(&self) -> Address {
        self.reserved.end()
    }

    /// Ranges currently allocated to archive regions, with their open flag.
    pub fn allocated(&self) -> Vec<(MemRange, bool)> {
        self.allocated.lock().unwrap().clone()
    }

    pub fn filled(&self) -> Vec<(MemRange, bool)> {
        self.filled.lock().unwrap().clone()
    }
}

impl ArchiveHeap for MockHeap {
    fn supports_archive_heap(&self) -> bool {
        self.supported
    }

    fn reserved_range(&self) -> MemRange {
        self.reserved
    }

    fn region_granularity(&self) -> usize {
        self.granularity
    }

    fn check_archive_ranges(&self, ranges: &[MemRange]) -> bool {
        ranges.iter().all(|r| self.reserved.contains_range(r))
    }

    fn alloc_archive_ranges(&self, ranges: &[MemRange], open: bool) -> bool {
        if open && self.refuse_open.load(Ordering::SeqCst) {
            return false;
        }
        let mut allocated = self.allocated.lock().unwrap();
        if ranges
            .iter()
            .any(|r| allocated.iter().any(|(a, _)| a.overlaps(r)))
        {
            return false;
        }
        allocated.extend(ranges.iter().map(|r| (*r, open)));
        true
    }

    fn dealloc_archive_ranges(&self, ranges: &[MemRange], _open: bool) {
        let mut allocated = self.allocated.lock().unwrap();
        allocated.retain(|(a, _)| !ranges.contains(a));
        self.filled.lock().unwrap().retain(|(a, _)| !ranges.contains(a));
        for r in ranges {
            // The file mapping is replaced by fresh heap memory.
            memory::dzmmap(r.start, r.size, MmapProtection::ReadWrite, mmap_anno_test!())
                .expect("Unable to recommit mock heap range");
        }
    }

    fn fill_archive_regions(&self, ranges: &[MemRange], open: bool) {
        self.filled.lock().unwrap().extend(ranges.iter().map(|r| (*r, open)));
    }
}

impl Drop for MockHeap {
    fn drop(&mut self) {
        let _ = memory::munmap(self.mapping.start, self.mapping.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_must_be_inside_and_disjoint() {
        let heap = MockHeap::new(0x40_0000, 0x10_0000);
        assert!(heap.start().is_aligned_to(0x10_0000));
        let a = MemRange::new(heap.end() - 0x2000usize, 0x1000);
        let outside = MemRange::new(heap.end(), 0x1000);
        assert!(heap.check_archive_ranges(&[a]));
        assert!(!heap.check_archive_ranges(&[a, outside]));
        assert!(heap.alloc_archive_ranges(&[a], false));
        assert!(!heap.alloc_archive_ranges(&[a], true));
        heap.dealloc_archive_ranges(&[a], false);
        assert!(heap.allocated().is_empty());
        heap.refuse_open_ranges();
        assert!(!heap.alloc_archive_ranges(&[a], true));
        assert!(heap.alloc_archive_ranges(&[a], false));
    }
}
