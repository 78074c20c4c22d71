use super::scenario_prelude::*;
use crate::util::options::Options;

fn layered_options(fx: &ArchiveFixture) -> Options {
    let mut options = fx.options();
    options.dynamic_archive_file = fx.dynamic_archive().to_string_lossy().into_owned();
    options
}

/// Map the static archive of `fx`, load a few more classes and dump them on top.
fn dump_top_layer(fx: &ArchiveFixture) -> FileMapHeader {
    let mut spaces = fx.spaces(layered_options(fx), Arc::new(NoArchiveHeap));
    assert!(spaces.initialize());
    assert!(spaces.dynamic_archive().is_none());
    let boot = spaces.graph().boot();
    assert!(spaces.load_shared_class("java/lang/Object", &boot).is_some());
    ArchiveFixture::define(&spaces, &[TestClass::app("com/example/Main")]);
    spaces.dump_dynamic_archive()
}

#[test]
fn top_layer_maps_right_above_the_base() {
    serial_test(|| {
        let fx = ArchiveFixture::new();
        let base = fx.dump_static(&[TestClass::boot("java/lang/Object")]);
        let top = dump_top_layer(&fx);
        assert_eq!(top.kind(), ArchiveKind::Dynamic);
        assert_eq!(top.mapped_base_address, base.mapped_top());
        let ext = top.dynamic.unwrap();
        assert_eq!(ext.base_header_crc, base.crc);
        assert_eq!(ext.base_region_crc, base.region_crcs());

        let mut spaces = fx.spaces(layered_options(&fx), Arc::new(NoArchiveHeap));
        assert!(spaces.initialize());
        let dynamic = spaces.dynamic_archive().unwrap();
        assert_eq!(dynamic.info().base_archive_name(), Some(&*fx.static_archive().to_string_lossy()));
        assert_eq!(
            spaces.shared_metaspace_range(),
            MemRange::from_bounds(fx.base, top.mapped_top())
        );
        // The shared class was not archived again.
        assert_eq!(dynamic.catalog().len(), 1);
        assert_eq!(spaces.num_shared_classes(), 2);

        let app = spaces.graph().find_or_create(loader_ref(LoaderKind::App), LoaderKind::App);
        let main = spaces.load_shared_class("com/example/Main", &app).unwrap();
        assert!(main.metadata.start >= top.mapped_base_address);
        assert!(spaces.is_in_shared_metaspace(main.metadata.start));
        let boot = spaces.graph().boot();
        let object = spaces.load_shared_class("java/lang/Object", &boot).unwrap();
        assert!(object.metadata.start < top.mapped_base_address);
    })
}

#[test]
fn top_layer_of_another_base_is_dropped() {
    serial_test(|| {
        let fx = ArchiveFixture::new();
        fx.dump_static(&[TestClass::boot("java/lang/Object")]);
        dump_top_layer(&fx);
        // A new base archive, with different contents.
        let base = fx.dump_static(&[TestClass::boot("java/lang/Object"), TestClass::boot("java/lang/String")]);

        let info = FileMapInfo::open(&fx.dynamic_archive(), ArchiveKind::Dynamic, &fx.env(), &fx.options()).unwrap();
        assert!(matches!(
            info.validate_base_archive(&base),
            Err(ArchiveError::BaseArchiveMismatch(_))
        ));

        let mut spaces = fx.spaces(layered_options(&fx), Arc::new(NoArchiveHeap));
        assert!(spaces.initialize());
        assert!(spaces.dynamic_archive().is_none());
        assert_eq!(
            spaces.shared_metaspace_range(),
            spaces.static_archive().unwrap().mapped_range()
        );
        let app = spaces.graph().find_or_create(loader_ref(LoaderKind::App), LoaderKind::App);
        assert!(spaces.load_shared_class("com/example/Main", &app).is_none());
    })
}

#[test]
fn dropping_the_context_unmaps_both_layers() {
    serial_test(|| {
        let fx = ArchiveFixture::new();
        let base = fx.dump_static(&[TestClass::boot("java/lang/Object")]);
        let top = dump_top_layer(&fx);
        let mut spaces = fx.spaces(layered_options(&fx), Arc::new(NoArchiveHeap));
        assert!(spaces.initialize());
        assert!(spaces.dynamic_archive().is_some());
        drop(spaces);

        let size = top.mapped_top() - base.mapped_base_address;
        let again = crate::util::memory::reserve_at(fx.base, size, mmap_anno_test!()).unwrap();
        crate::util::memory::munmap(again, size).unwrap();
    })
}

#[test]
#[should_panic(expected = "static archive is mapped")]
fn top_layer_needs_a_mapped_base() {
    serial_test(|| {
        let fx = ArchiveFixture::new();
        let spaces = fx.spaces(layered_options(&fx), Arc::new(NoArchiveHeap));
        spaces.dump_dynamic_archive();
    })
}
