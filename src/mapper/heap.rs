//! Mapping the archived heap regions into the collector's heap.
//!
//! The heap owns the memory: ranges are obtained from the collector with
//! [`ArchiveHeap::alloc_archive_ranges`] and always given back through
//! [`ArchiveHeap::dealloc_archive_ranges`], never unmapped here.

use crate::archive::format::{FileMapHeader, RegionKind};
use crate::archive::FileMapInfo;
use crate::error::{ArchiveError, Result};
use crate::util::constants::BYTES_IN_NARROW_OOP;
use crate::util::conversions::raw_align_up;
use crate::util::memory::{self, MmapAnnotation, MmapProtection};
use crate::util::{Address, BitMap, MemRange};
use crate::vm::{ArchiveHeap, NarrowKlassEncoding, NarrowOopEncoding, VMEnvironment};

/// Where the archived heap regions go in this process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapRelocation {
    /// The narrow-oop encoding the archive was dumped with.
    pub dump_encoding: NarrowOopEncoding,
    /// Added to every dump-time address.
    pub delta: isize,
    /// Do the narrow oops inside the regions need rewriting?
    pub needs_patching: bool,
}

impl HeapRelocation {
    /// The runtime address of a heap region recorded as `narrow` at dump time.
    pub fn region_bottom(&self, narrow: u32) -> Address {
        self.dump_encoding.decode_not_null(narrow) + self.delta
    }
}

fn dump_encoding(header: &FileMapHeader) -> NarrowOopEncoding {
    NarrowOopEncoding::new(header.narrow_oop_mode, header.narrow_oop_base, header.narrow_oop_shift)
}

fn heap_regions(header: &FileMapHeader) -> impl Iterator<Item = (RegionKind, u32, usize)> + '_ {
    let alignment = header.alignment as usize;
    RegionKind::CLOSED_HEAP
        .into_iter()
        .chain(RegionKind::OPEN_HEAP)
        .map(move |kind| (kind, header.region(kind)))
        .filter(|(_, region)| !region.is_empty())
        .map(move |(kind, region)| (kind, region.addr as u32, raw_align_up(region.used(), alignment)))
}

/// Does the archive carry any heap region?
pub fn has_heap_regions(header: &FileMapHeader) -> bool {
    heap_regions(header).next().is_some()
}

/// Decide whether and by how much the archived heap must move.
///
/// The regions stay where they were if the live encodings equal the dump-time ones and the
/// regions, read with the live encoding, fall inside the live heap. Otherwise they are moved
/// so that they end where the live heap ends, adjusted down so that the bottom of the first
/// region sits on a collector region boundary.
pub fn compute_relocation(
    header: &FileMapHeader,
    live_oop: &NarrowOopEncoding,
    live_klass: &NarrowKlassEncoding,
    live_reserved: MemRange,
    region_granularity: usize,
) -> HeapRelocation {
    let dump = dump_encoding(header);
    let mut needs_patching = dump != *live_oop
        || header.narrow_klass_base != live_klass.base
        || header.narrow_klass_shift != live_klass.shift;

    let in_live_heap = heap_regions(header).all(|(_, narrow, size)| {
        let start = live_oop.decode_not_null(narrow);
        live_reserved.contains_range(&MemRange::new(start, size))
    });
    if !in_live_heap {
        needs_patching = true;
    }

    let mut delta = 0isize;
    if needs_patching {
        delta = live_reserved.end().as_usize() as isize - header.heap_reserved_end.as_usize() as isize;
        if let Some((_, narrow, _)) = heap_regions(header).next() {
            let bottom = dump.decode_not_null(narrow) + delta;
            let misalignment = bottom.as_usize() % region_granularity;
            if misalignment != 0 {
                delta -= misalignment as isize;
            }
        }
    }
    HeapRelocation {
        dump_encoding: dump,
        delta,
        needs_patching,
    }
}

/// Rewrite every narrow oop marked in `oopmap` from the dump-time encoding to `live`, moving
/// it by `relocation.delta`. Returns the number of non-null oops patched.
pub fn patch_heap_region(
    region: MemRange,
    oopmap: &BitMap,
    relocation: &HeapRelocation,
    live: &NarrowOopEncoding,
) -> Result<usize> {
    let mut patched = 0;
    for bit in oopmap.iter_set_bits() {
        let offset = bit * BYTES_IN_NARROW_OOP;
        if offset + BYTES_IN_NARROW_OOP > region.size {
            return Err(ArchiveError::CorruptedData("oopmap extends past its region"));
        }
        let slot = region.start + offset;
        let v = unsafe { slot.load::<u32>() };
        if v == 0 {
            continue;
        }
        let target = relocation
            .dump_encoding
            .decode_not_null(v)
            .checked_offset(relocation.delta)
            .ok_or(ArchiveError::CorruptedData("relocated oop leaves the address space"))?;
        let new_v = live.encode(target)?;
        trace!("patch {}: {:#x} -> {:#x} ({})", slot, v, new_v, target);
        unsafe { slot.store::<u32>(new_v) };
        #[cfg(feature = "extreme_assertions")]
        assert_eq!(live.decode(unsafe { slot.load::<u32>() }), target);
        patched += 1;
    }
    Ok(patched)
}

/// The heap ranges an archive currently holds.
#[derive(Clone, Debug, Default)]
pub struct MappedHeap {
    pub closed: Vec<MemRange>,
    pub open: Vec<MemRange>,
    pub relocation: Option<HeapRelocation>,
}

impl MappedHeap {
    pub fn is_mapped(&self) -> bool {
        !self.closed.is_empty() || !self.open.is_empty()
    }

    /// Hand every range back to the collector.
    pub(super) fn release(&mut self, heap: &dyn ArchiveHeap) {
        if !self.open.is_empty() {
            heap.dealloc_archive_ranges(&self.open, true);
            self.open.clear();
        }
        if !self.closed.is_empty() {
            heap.dealloc_archive_ranges(&self.closed, false);
            self.closed.clear();
        }
    }
}

/// Map the heap regions of `info`. A failure here is never fatal to the archive: the
/// metadata stays usable and the archived heap objects are not used. If the open half fails,
/// the closed half stays mapped.
pub(super) fn map_heap_regions(info: &FileMapInfo, heap: &dyn ArchiveHeap, env: &VMEnvironment) -> MappedHeap {
    let mut mapped = MappedHeap::default();
    let header = info.header();
    if !has_heap_regions(header) {
        return mapped;
    }
    if !heap.supports_archive_heap() {
        info!("Archived heap regions are not used: the heap does not support them");
        return mapped;
    }
    let relocation = compute_relocation(
        header,
        &env.narrow_oop,
        &env.narrow_klass,
        heap.reserved_range(),
        heap.region_granularity(),
    );
    if relocation.needs_patching {
        info!("Archived heap data is relocated by {:#x} bytes", relocation.delta);
    }
    mapped.relocation = Some(relocation);

    match map_heap_half(info, heap, env, &relocation, false) {
        Ok(ranges) => mapped.closed = ranges,
        Err(e) => {
            info!("Unable to map closed archive heap regions: {}", e);
            return mapped;
        }
    }
    match map_heap_half(info, heap, env, &relocation, true) {
        Ok(ranges) => mapped.open = ranges,
        Err(e) => info!("Unable to map open archive heap regions: {}", e),
    }
    mapped
}

fn map_heap_half(
    info: &FileMapInfo,
    heap: &dyn ArchiveHeap,
    env: &VMEnvironment,
    relocation: &HeapRelocation,
    open: bool,
) -> Result<Vec<MemRange>> {
    let header = info.header();
    let half = if open { "open" } else { "closed" };
    let kinds = if open {
        RegionKind::OPEN_HEAP
    } else {
        RegionKind::CLOSED_HEAP
    };
    let regions: Vec<(RegionKind, MemRange)> = heap_regions(header)
        .filter(|(kind, _, _)| kinds.contains(kind))
        .map(|(kind, narrow, size)| (kind, MemRange::new(relocation.region_bottom(narrow), size)))
        .collect();
    if regions.is_empty() {
        return Ok(vec![]);
    }
    let ranges: Vec<MemRange> = regions.iter().map(|(_, r)| *r).collect();

    if !heap.check_archive_ranges(&ranges) {
        return Err(ArchiveError::HeapUnavailable(format!(
            "{} archive heap regions are not within java heap",
            half
        )));
    }
    if !heap.alloc_archive_ranges(&ranges, open) {
        return Err(ArchiveError::HeapUnavailable(format!(
            "unable to allocate {} archive heap regions",
            half
        )));
    }

    let result = map_and_patch(info, env, relocation, &regions);
    match result {
        Ok(()) => {
            heap.fill_archive_regions(&ranges, open);
            for (kind, range) in &regions {
                debug!("Mapped {} heap region {} at {}", half, kind, range);
            }
            Ok(ranges)
        }
        Err(e) => {
            heap.dealloc_archive_ranges(&ranges, open);
            Err(e)
        }
    }
}

fn map_and_patch(
    info: &FileMapInfo,
    env: &VMEnvironment,
    relocation: &HeapRelocation,
    regions: &[(RegionKind, MemRange)],
) -> Result<()> {
    let header = info.header();
    for (kind, range) in regions {
        let region = header.region(*kind);
        let prot = if relocation.needs_patching {
            MmapProtection::ReadWrite
        } else {
            MmapProtection::for_region(region.read_only, region.allow_exec)
        };
        memory::map_file_at(
            info.file(),
            region.file_offset,
            range.start,
            region.used(),
            prot,
            &MmapAnnotation::Region { name: &kind.to_string() },
        )
        .map_err(|e| ArchiveError::MapFailed {
            region: *kind,
            addr: range.start,
            reason: e.to_string(),
        })?;
        info.verify_region_checksum(*kind, unsafe { range.start.as_bytes(region.used()) })?;
    }
    if !relocation.needs_patching {
        return Ok(());
    }
    for (kind, range) in regions {
        let region = header.region(*kind);
        let oopmap = info.read_oopmap(*kind)?;
        let patched = patch_heap_region(
            MemRange::new(range.start, region.used()),
            &oopmap,
            relocation,
            &env.narrow_oop,
        )?;
        debug!("Patched {} oops in heap region {}", patched, kind);
        if region.read_only {
            if let Err(e) = memory::mprotect(range.start, range.size, MmapProtection::ReadOnly) {
                warn!("Unable to protect heap region {}: {}", kind, e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::format::ArchiveKind;
    use crate::vm::NarrowOopMode;

    fn addr(v: usize) -> Address {
        unsafe { Address::from_usize(v) }
    }

    const GRANULE: usize = 0x10_0000;

    /// A header whose heap was reserved at [dump_start, dump_end) with one closed region at
    /// `closed` and one open region at `open`, 2 pages each.
    fn header(encoding: NarrowOopEncoding, dump_start: usize, dump_end: usize, closed: usize, open: usize) -> FileMapHeader {
        let mut h = FileMapHeader::new(ArchiveKind::Static, "reloc");
        h.alignment = 4096;
        h.narrow_oop_mode = encoding.mode;
        h.narrow_oop_base = encoding.base;
        h.narrow_oop_shift = encoding.shift;
        h.heap_reserved_start = addr(dump_start);
        h.heap_reserved_end = addr(dump_end);
        h.region_mut(RegionKind::ClosedHeap0).addr = encoding.encode(addr(closed)).unwrap() as u64;
        h.region_mut(RegionKind::ClosedHeap0).used = 8192;
        h.region_mut(RegionKind::OpenHeap0).addr = encoding.encode(addr(open)).unwrap() as u64;
        h.region_mut(RegionKind::OpenHeap0).used = 8192;
        h
    }

    fn zero_based() -> NarrowOopEncoding {
        NarrowOopEncoding::new(NarrowOopMode::ZeroBased, Address::ZERO, 3)
    }

    #[test]
    fn same_encoding_same_heap_needs_nothing() {
        let enc = zero_based();
        let h = header(enc, 0x1_0000_0000, 0x1_4000_0000, 0x1_3ff0_0000, 0x1_3ff8_0000);
        let live = MemRange::from_bounds(addr(0x1_0000_0000), addr(0x1_4000_0000));
        let r = compute_relocation(&h, &enc, &NarrowKlassEncoding::new(Address::ZERO, 0), live, GRANULE);
        assert!(!r.needs_patching);
        assert_eq!(r.delta, 0);
        assert_eq!(r.region_bottom(h.region(RegionKind::ClosedHeap0).addr as u32), addr(0x1_3ff0_0000));
    }

    #[test]
    fn moved_heap_relocates_by_end_difference() {
        let enc = zero_based();
        let h = header(enc, 0x1_0000_0000, 0x1_4000_0000, 0x1_3ff0_0000, 0x1_3ff8_0000);
        // same encoding, the live heap is 1 GB lower
        let live = MemRange::from_bounds(addr(0xc000_0000), addr(0x1_0000_0000));
        let r = compute_relocation(&h, &enc, &NarrowKlassEncoding::new(Address::ZERO, 0), live, GRANULE);
        assert!(r.needs_patching);
        assert_eq!(r.delta, 0x1_0000_0000isize - 0x1_4000_0000isize);
        let a0 = addr(0x1_3ff8_1000);
        let a1 = a0 + r.delta;
        assert_eq!(a1, addr(0xfff8_1000));
        assert!(live.contains(a1));
    }

    #[test]
    fn misaligned_bottom_is_pulled_down() {
        let enc = zero_based();
        let h = header(enc, 0x1_0000_0000, 0x1_4000_0000, 0x1_3ff0_0000, 0x1_3ff8_0000);
        // the live heap ends 0x3000 bytes past a granule boundary
        let live = MemRange::from_bounds(addr(0xc000_0000), addr(0x1_0000_3000));
        let r = compute_relocation(&h, &enc, &NarrowKlassEncoding::new(Address::ZERO, 0), live, GRANULE);
        assert!(r.needs_patching);
        assert_eq!(r.delta, 0x1_0000_0000isize - 0x1_4000_0000isize);
        assert!(r.region_bottom(h.region(RegionKind::ClosedHeap0).addr as u32).is_aligned_to(GRANULE));
    }

    #[test]
    fn klass_encoding_change_forces_patching() {
        let enc = zero_based();
        let h = header(enc, 0x1_0000_0000, 0x1_4000_0000, 0x1_3ff0_0000, 0x1_3ff8_0000);
        let live = MemRange::from_bounds(addr(0x1_0000_0000), addr(0x1_4000_0000));
        let r = compute_relocation(&h, &enc, &NarrowKlassEncoding::new(addr(0x8_0000_0000), 3), live, GRANULE);
        assert!(r.needs_patching);
        assert_eq!(r.delta, 0);
    }

    #[test]
    fn patch_rewrites_marked_slots_only() {
        let dump = NarrowOopEncoding::new(NarrowOopMode::HeapBased, addr(0x10_0000), 3);
        let live = NarrowOopEncoding::new(NarrowOopMode::HeapBased, addr(0x8_0000), 3);
        let relocation = HeapRelocation {
            dump_encoding: dump,
            delta: 0x4000,
            needs_patching: true,
        };
        let mut words: Vec<u32> = vec![0; 8];
        let target = addr(0x10_8000);
        words[1] = dump.encode(target).unwrap();
        words[2] = 0xdead; // not an oop
        words[3] = 0; // null oop
        let mut oopmap = BitMap::new(8);
        oopmap.set_bit(1);
        oopmap.set_bit(3);
        let region = MemRange::new(Address::from_mut_ptr(words.as_mut_ptr()), 32);
        assert_eq!(patch_heap_region(region, &oopmap, &relocation, &live).unwrap(), 1);
        assert_eq!(live.decode(words[1]), target + 0x4000usize);
        assert_eq!(words[2], 0xdead);
        assert_eq!(words[3], 0);
    }

    #[test]
    fn patch_reports_unencodable_targets() {
        let dump = NarrowOopEncoding::new(NarrowOopMode::HeapBased, addr(0x10_0000), 3);
        let live = NarrowOopEncoding::new(NarrowOopMode::HeapBased, addr(0x1000_0000), 3);
        let relocation = HeapRelocation {
            dump_encoding: dump,
            delta: 0,
            needs_patching: true,
        };
        let mut words: Vec<u32> = vec![dump.encode(addr(0x10_8000)).unwrap()];
        let mut oopmap = BitMap::new(1);
        oopmap.set_bit(0);
        let region = MemRange::new(Address::from_mut_ptr(words.as_mut_ptr()), 4);
        assert!(matches!(
            patch_heap_region(region, &oopmap, &relocation, &live),
            Err(ArchiveError::EncodingOverflow { .. })
        ));
    }

    #[test]
    fn patch_rejects_oops_moved_below_zero() {
        let dump = NarrowOopEncoding::new(NarrowOopMode::HeapBased, addr(0x10_0000), 3);
        let relocation = HeapRelocation {
            dump_encoding: dump,
            delta: -0x20_0000,
            needs_patching: true,
        };
        let mut words: Vec<u32> = vec![dump.encode(addr(0x10_8000)).unwrap()];
        let mut oopmap = BitMap::new(1);
        oopmap.set_bit(0);
        let region = MemRange::new(Address::from_mut_ptr(words.as_mut_ptr()), 4);
        assert!(matches!(
            patch_heap_region(region, &oopmap, &relocation, &dump),
            Err(ArchiveError::CorruptedData(_))
        ));
        assert_eq!(words[0], dump.encode(addr(0x10_8000)).unwrap());
    }
}
