//! Producing an archive from the live class loader data graph.
//!
//! Dumping has no fallback: every failure here is fatal.

use super::catalog::{self, ArchivedClass, SerializedRoot, STUB_SIZE};
use super::format::{ArchiveKind, FileMapHeader, RegionKind};
use super::misc_info::SharedPathsMiscInfo;
use super::path_table::SharedPathTable;
use super::reader::FileMapInfo;
use super::writer::{ArchivedHeapRange, FileMapWriter};
use crate::classloader::{ClassLoaderDataGraph, Klass, LoaderKind};
use crate::error::fail_stop;
use crate::util::conversions::{bytes_to_narrow_oop_slots, raw_align_up};
use crate::util::memory::allocation_granularity;
use crate::util::options::Options;
use crate::util::Address;
use crate::vm::{ArchiveHeap, ClassPathResolver, VMEnvironment};
use std::path::Path;
use std::sync::Arc;

/// The heap objects to archive, as laid out by the collector: closed regions hold objects
/// with no references out of the archive; open regions may reference the rest of the heap.
#[derive(Clone, Debug, Default)]
pub struct ArchivedHeapSnapshot {
    pub closed: Vec<ArchivedHeapRange>,
    pub open: Vec<ArchivedHeapRange>,
}

/// What a dump reads from the process.
pub struct DumpContext<'a> {
    pub options: &'a Options,
    pub env: &'a VMEnvironment,
    pub resolver: &'a dyn ClassPathResolver,
    pub graph: &'a ClassLoaderDataGraph,
    pub heap: &'a dyn ArchiveHeap,
}

struct ArchiveContents<'a> {
    misc_info: Vec<u8>,
    base_archive_name: Option<String>,
    stubs: Vec<u8>,
    path_table: Vec<u8>,
    catalog: Vec<u8>,
    root: Vec<u8>,
    heap: Option<&'a ArchivedHeapSnapshot>,
}

struct Layout {
    mc: Address,
    rw: Address,
    ro: Address,
    md: Address,
}

impl Layout {
    fn new(base: Address, alignment: usize, mc: usize, rw: usize, ro: usize) -> Self {
        let rw_base = base + raw_align_up(mc, alignment);
        let ro_base = rw_base + raw_align_up(rw, alignment);
        Layout {
            mc: base,
            rw: rw_base,
            ro: ro_base,
            md: ro_base + raw_align_up(ro, alignment),
        }
    }
}

/// The classes a dump archives: those of the built-in loaders that come from a recorded,
/// unsigned classpath entry. A dynamic dump skips classes that are already archived.
fn collect_classes(
    graph: &ClassLoaderDataGraph,
    table: &SharedPathTable,
    kind: ArchiveKind,
) -> Vec<(LoaderKind, Arc<Klass>)> {
    let mut classes = vec![];
    graph.loaded_classes_do(&mut |cld, klass| {
        let loader = cld.loader_kind();
        if !loader.is_builtin() || cld.is_unsafe_anonymous() {
            trace!("Skipping {}: not defined by a built-in loader", klass.name);
            return;
        }
        if kind == ArchiveKind::Dynamic && klass.shared {
            return;
        }
        let entry = usize::try_from(klass.path_index).ok().and_then(|i| table.entry(i));
        match entry {
            None => debug!("Skipping {}: not loaded from a shared path", klass.name),
            Some(e) if e.signed => info!("Skipping {}: from signed JAR {}", klass.name, e.name),
            Some(_) => classes.push((loader, klass.clone())),
        }
    });
    classes.sort_by(|(la, a), (lb, b)| (*la as u8, &a.name).cmp(&(*lb as u8, &b.name)));
    classes
}

fn new_header(cx: &DumpContext, kind: ArchiveKind) -> FileMapHeader {
    let mut header = FileMapHeader::new(kind, &cx.env.vm_version);
    header.alignment = allocation_granularity() as u32;
    header.obj_alignment = cx.options.object_alignment_in_bytes as u32;
    header.compact_strings = cx.options.compact_strings;
    header.narrow_oop_mode = cx.env.narrow_oop.mode;
    header.narrow_oop_base = cx.env.narrow_oop.base;
    header.narrow_oop_shift = cx.env.narrow_oop.shift;
    header.narrow_klass_base = cx.env.narrow_klass.base;
    header.narrow_klass_shift = cx.env.narrow_klass.shift;
    header.max_heap_size = cx.options.max_heap_size as u64;
    let reserved = cx.heap.reserved_range();
    header.heap_reserved_start = reserved.start;
    header.heap_reserved_end = reserved.end();
    header.verify_local = cx.options.bytecode_verification_local;
    header.verify_remote = cx.options.bytecode_verification_remote;
    header.allow_archiving_with_java_agent = cx.options.allow_archiving_with_java_agent;
    header
}

fn write_body(w: &mut FileMapWriter, contents: &ArchiveContents, layout: &Layout, env: &VMEnvironment) {
    w.write_header_section(&contents.misc_info, contents.base_archive_name.as_deref());
    w.write_region(RegionKind::Mc, &contents.stubs, layout.mc);
    w.write_region(RegionKind::Rw, &contents.path_table, layout.rw);
    w.write_region(RegionKind::Ro, &contents.catalog, layout.ro);
    w.write_region(RegionKind::Md, &contents.root, layout.md);
    if let Some(heap) = contents.heap {
        w.write_heap_regions(false, &heap.closed, &env.narrow_oop);
        w.write_heap_regions(true, &heap.open, &env.narrow_oop);
        w.write_oopmaps(false, &heap.closed);
        w.write_oopmaps(true, &heap.open);
    }
}

fn check_heap_snapshot(snapshot: &ArchivedHeapSnapshot) {
    for range in snapshot.closed.iter().chain(&snapshot.open) {
        if range.oopmap.size_in_bits() != bytes_to_narrow_oop_slots(range.range.size) {
            fail_stop(format!(
                "Oopmap of archived heap range {} has {} bits, expected {}",
                range.range,
                range.oopmap.size_in_bits(),
                bytes_to_narrow_oop_slots(range.range.size)
            ));
        }
    }
}

fn dump(
    cx: &DumpContext,
    path: &Path,
    kind: ArchiveKind,
    base: Address,
    base_archive: Option<&FileMapInfo>,
    heap: Option<&ArchivedHeapSnapshot>,
) -> FileMapHeader {
    let mut header = new_header(cx, kind);
    let mut misc_info = SharedPathsMiscInfo::new();
    let table = SharedPathTable::build(cx.resolver, &mut misc_info).unwrap_or_else(|e| fail_stop(e));

    let classes = collect_classes(cx.graph, &table, kind);
    header.has_platform_or_app_classes = classes
        .iter()
        .any(|(loader, _)| matches!(loader, LoaderKind::Platform | LoaderKind::App));
    header.max_used_path_index = classes.iter().map(|(_, k)| k.path_index).max().unwrap_or(-1);
    header.num_shared_paths = table.len() as u32;
    header.app_class_paths_start_index = table.app_class_paths_start_index;
    header.app_module_paths_start_index = table.app_module_paths_start_index;
    header.num_module_paths = table.num_module_paths;
    header.mapped_base_address = base;
    if let (Some(ext), Some(base_archive)) = (header.dynamic.as_mut(), base_archive) {
        ext.base_header_crc = base_archive.header().crc;
        ext.base_region_crc = base_archive.header().region_crcs();
    }

    let archived: Vec<ArchivedClass> = classes
        .iter()
        .map(|(loader, klass)| ArchivedClass {
            name: &klass.name,
            loader: *loader,
            path_index: klass.path_index,
            metadata: unsafe { klass.metadata.start.as_bytes(klass.metadata.size) },
        })
        .collect();
    let catalog = catalog::serialize_catalog(&archived);
    let path_table = table.serialize();
    header.shared_path_table_offset = 0;
    header.shared_path_table_size = path_table.len() as u64;

    let alignment = header.alignment as usize;
    let layout = Layout::new(
        base,
        alignment,
        archived.len() * STUB_SIZE,
        path_table.len(),
        catalog.len(),
    );
    let stubs = catalog::build_stub_table(&catalog, layout.ro).unwrap_or_else(|e| fail_stop(e));
    let root = SerializedRoot {
        catalog_offset: 0,
        catalog_size: catalog.len() as u64,
        class_count: archived.len() as u64,
        stub_table_offset: 0,
    };
    header.serialized_data_offset = 0;

    if let Some(snapshot) = heap {
        check_heap_snapshot(snapshot);
    }
    let contents = ArchiveContents {
        misc_info: misc_info.finish(),
        base_archive_name: base_archive.map(|b| b.path().to_string_lossy().into_owned()),
        stubs,
        path_table,
        catalog,
        root: root.to_bytes(),
        heap,
    };

    let mut pass = FileMapWriter::layout(header);
    write_body(&mut pass, &contents, &layout, cx.env);
    let header = pass.finish();
    let mut pass = FileMapWriter::create(path, header);
    write_body(&mut pass, &contents, &layout, cx.env);
    let header = pass.finish();

    info!(
        "Dumped {} {} classes ({} platform/app) mapped at {}",
        archived.len(),
        kind,
        archived
            .iter()
            .filter(|c| c.loader != LoaderKind::Boot)
            .count(),
        base
    );
    header
}

/// Dump the base archive. Metadata regions are laid out at `shared_base_address`. Heap
/// regions are written only if the collector supports them and a snapshot is given.
pub fn dump_static_archive(cx: &DumpContext, path: &Path, heap: Option<&ArchivedHeapSnapshot>) -> FileMapHeader {
    let heap = heap.filter(|_| {
        let supported = cx.heap.supports_archive_heap();
        if !supported {
            info!("Archived heap objects are not supported by this heap; dumping metadata only");
        }
        supported
    });
    let base = unsafe { Address::from_usize(cx.options.shared_base_address) };
    dump(cx, path, ArchiveKind::Static, base, None, heap)
}

/// Dump a top-layer archive of the classes loaded since `base` was mapped. It is laid out
/// right above the base archive.
pub fn dump_dynamic_archive(cx: &DumpContext, path: &Path, base: &FileMapInfo) -> FileMapHeader {
    if !base.header().is_static() {
        fail_stop("A dynamic archive can only be dumped on top of a static archive");
    }
    let top = base.header().mapped_top();
    dump(cx, path, ArchiveKind::Dynamic, top, Some(base), None)
}
