use super::scenario_prelude::*;
use crate::util::memory;

fn flip_last_ro_byte(fx: &ArchiveFixture, header: &FileMapHeader) {
    let ro = header.region(RegionKind::Ro);
    let at = ro.file_offset + ro.used - 1;
    let info = open_static(fx).unwrap();
    let original = info.read_region(RegionKind::Ro).unwrap();
    patch_file(&fx.static_archive(), at, &[!original[original.len() - 1]]);
}

#[test]
fn flipped_byte_fails_only_its_region() {
    serial_test(|| {
        let fx = ArchiveFixture::new();
        let header = fx.dump_static(&[TestClass::boot("java/lang/Object"), TestClass::app("com/example/Main")]);
        flip_last_ro_byte(&fx, &header);

        let info = open_static(&fx).unwrap();
        for kind in RegionKind::NON_HEAP {
            let data = info.read_region(kind).unwrap();
            let result = info.verify_region_checksum(kind, &data);
            if kind == RegionKind::Ro {
                match result {
                    Err(ArchiveError::RegionCrcMismatch { region, expected, actual }) => {
                        assert_eq!(region, RegionKind::Ro);
                        assert_eq!(expected, header.region(RegionKind::Ro).crc);
                        assert_ne!(expected, actual);
                    }
                    other => panic!("unexpected {:?}", other),
                }
            } else {
                assert!(result.is_ok(), "region {} should verify", kind);
            }
        }
    })
}

#[test]
fn checksum_failure_rolls_the_mapping_back() {
    serial_test(|| {
        let fx = ArchiveFixture::new();
        let header = fx.dump_static(&[TestClass::boot("java/lang/Object")]);
        flip_last_ro_byte(&fx, &header);

        let mut spaces = fx.spaces(fx.options(), Arc::new(NoArchiveHeap));
        assert!(!spaces.initialize());
        assert!(spaces.shared_metaspace_range().is_empty());
        assert!(!spaces.is_in_shared_metaspace(fx.base));

        // The reservation is gone: the same range can be reserved again.
        let size = header.non_heap_size();
        let again = memory::reserve_at(fx.base, size, mmap_anno_test!()).unwrap();
        memory::munmap(again, size).unwrap();
    })
}

#[test]
fn unverified_archive_maps_despite_the_flip() {
    serial_test(|| {
        let fx = ArchiveFixture::new();
        let header = fx.dump_static(&[TestClass::boot("java/lang/Object")]);
        flip_last_ro_byte(&fx, &header);

        let mut options = fx.options();
        options.verify_shared_spaces = false;
        let mut spaces = fx.spaces(options, Arc::new(NoArchiveHeap));
        assert!(spaces.initialize());
    })
}
