//! The process-wide shared-archive context.
//!
//! [`SharedSpaces`] owns everything that exists once per process: the class loader data
//! graph, the mapped archive layers, and the "use shared spaces" decision. It is constructed
//! explicitly and passed around; teardown drops the dynamic layer before the static one.

use crate::archive::catalog::{read_stub, CatalogEntry};
use crate::archive::dump::{self, ArchivedHeapSnapshot, DumpContext};
use crate::archive::{ArchiveKind, FileMapHeader, FileMapInfo};
use crate::classloader::{ClassLoaderData, ClassLoaderDataGraph, Klass, LoaderKind, Metaspace};
use crate::error::{fail_stop, ArchiveError, Result};
use crate::mapper::{MappedArchive, SharedRange};
use crate::util::options::Options;
use crate::util::safepoint::{SafepointGuard, SafepointSynchronizer};
use crate::util::{Address, MemRange, ObjectReference};
use crate::vm::{ArchiveHeap, ClassPathResolver, VMEnvironment};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bytes a restored class takes in its loader's arena. The class body stays in the archive.
const SHARED_CLASS_RECORD_SIZE: usize = 64;

/// Which mapped layer a catalog entry comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Layer {
    Static,
    Dynamic,
}

pub struct SharedSpaces {
    pub options: Arc<Options>,
    env: VMEnvironment,
    heap: Arc<dyn ArchiveHeap>,
    resolver: Box<dyn ClassPathResolver>,
    graph: ClassLoaderDataGraph,
    safepoint: Arc<SafepointSynchronizer>,
    range: Arc<SharedRange>,
    use_shared_spaces: AtomicBool,
    dynamic_archive: Option<MappedArchive>,
    static_archive: Option<MappedArchive>,
    shared_classes: HashMap<(LoaderKind, String), (Layer, CatalogEntry)>,
}

impl SharedSpaces {
    /// Create the context. Nothing is mapped until [`SharedSpaces::initialize`].
    pub fn new(
        options: Options,
        env: VMEnvironment,
        heap: Arc<dyn ArchiveHeap>,
        resolver: Box<dyn ClassPathResolver>,
    ) -> Result<Self> {
        // Initialize the logger if we have not yet. A host that installed its own logger
        // makes this fail, which is fine.
        let _ = crate::util::logger::try_init();
        let space = Metaspace::new(options.metaspace_reserve_size, options.metaspace_chunk_size)?;
        let use_shared_spaces = options.use_shared_spaces;
        Ok(SharedSpaces {
            options: Arc::new(options),
            env,
            heap,
            resolver,
            graph: ClassLoaderDataGraph::new(Arc::new(space)),
            safepoint: Arc::new(SafepointSynchronizer::new()),
            range: Arc::new(SharedRange::new()),
            use_shared_spaces: AtomicBool::new(use_shared_spaces),
            dynamic_archive: None,
            static_archive: None,
            shared_classes: HashMap::new(),
        })
    }

    /// Map the configured archives. Returns whether sharing is in use afterwards.
    ///
    /// A failure of the static archive disables sharing, or stops the process if sharing is
    /// required. A failure of the dynamic archive only drops the dynamic layer.
    pub fn initialize(&mut self) -> bool {
        if !self.is_using_shared_spaces() {
            info!("Shared spaces are disabled");
            return false;
        }
        let path = self.options.shared_archive_file.clone();
        match self.map_static_archive(Path::new(&path)) {
            Ok(archive) => self.static_archive = Some(archive),
            Err(e) => {
                self.fail_continue(e);
                return false;
            }
        }

        if let Some(path) = self.options.dynamic_archive().map(str::to_owned) {
            match self.map_dynamic_archive(Path::new(&path)) {
                Ok(archive) => self.dynamic_archive = Some(archive),
                Err(e) => info!("Unable to use dynamic archive {}: {}", path, e),
            }
        }

        self.index_shared_classes();
        if self.options.print_shared_archive_and_exit {
            for archive in self.archives() {
                archive.info().print_info();
            }
        }
        info!(
            "Using shared spaces at {} with {} archived classes",
            self.range.range(),
            self.shared_classes.len()
        );
        true
    }

    fn map_static_archive(&self, path: &Path) -> Result<MappedArchive> {
        let mut info = FileMapInfo::open(path, ArchiveKind::Static, &self.env, &self.options)?;
        info.validate_header(&self.options, &self.env, &*self.resolver)?;
        MappedArchive::map(info, &self.options, &self.env, self.heap.clone(), self.range.clone())
    }

    fn map_dynamic_archive(&self, path: &Path) -> Result<MappedArchive> {
        let Some(base) = &self.static_archive else {
            return Err(ArchiveError::BaseArchiveMismatch("no static archive is mapped".into()));
        };
        let mut info = FileMapInfo::open(path, ArchiveKind::Dynamic, &self.env, &self.options)?;
        info.validate_header(&self.options, &self.env, &*self.resolver)?;
        info.validate_base_archive(base.header())?;
        if let Some(name) = info.base_archive_name() {
            if Path::new(name) != base.info().path() {
                debug!("Dynamic archive was dumped on top of {}, now on top of {}", name, base.info().path().display());
            }
        }
        MappedArchive::map(info, &self.options, &self.env, self.heap.clone(), self.range.clone())
    }

    fn index_shared_classes(&mut self) {
        let mut index = HashMap::new();
        let layers = [
            (Layer::Static, self.static_archive.as_ref()),
            (Layer::Dynamic, self.dynamic_archive.as_ref()),
        ];
        for (layer, archive) in layers {
            let Some(archive) = archive else { continue };
            for entry in archive.catalog() {
                index.insert((entry.loader, entry.name.clone()), (layer, entry.clone()));
            }
        }
        self.shared_classes = index;
    }

    /// Give up on the archive: unmap everything and continue without sharing. Stops the
    /// process instead if sharing is required.
    pub fn fail_continue(&mut self, err: ArchiveError) {
        if self.options.require_shared_spaces {
            fail_stop(format!("Unable to use shared archive: {}", err));
        }
        info!("Unable to use shared archive: {}", err);
        self.use_shared_spaces.store(false, Ordering::SeqCst);
        self.shared_classes.clear();
        self.dynamic_archive = None;
        self.static_archive = None;
    }

    pub fn is_using_shared_spaces(&self) -> bool {
        self.use_shared_spaces.load(Ordering::SeqCst)
    }

    /// Is `addr` inside the mapped metadata of any archive layer?
    pub fn is_in_shared_metaspace(&self, addr: Address) -> bool {
        self.range.contains(addr)
    }

    pub fn shared_metaspace_range(&self) -> MemRange {
        self.range.range()
    }

    /// Restore the archived class `name` into `cld`.
    ///
    /// Returns `None` if the class is not archived for the loader kind of `cld`, or if the
    /// classpath entry it came from no longer matches.
    pub fn load_shared_class(&self, name: &str, cld: &ClassLoaderData) -> Option<Arc<Klass>> {
        if !self.is_using_shared_spaces() || cld.is_unsafe_anonymous() {
            return None;
        }
        if let Some(klass) = cld.find_class(name) {
            return Some(klass);
        }
        let (layer, entry) = self.shared_classes.get(&(cld.loader_kind(), name.to_owned()))?;
        let archive = match layer {
            Layer::Static => self.static_archive.as_ref()?,
            Layer::Dynamic => self.dynamic_archive.as_ref()?,
        };
        if entry.loader != LoaderKind::Boot && !archive.header().has_platform_or_app_classes {
            debug!("Archived class {} is not used: non-system classes are disabled", name);
            return None;
        }
        if !archive.path_table().is_valid(entry.path_index) {
            debug!(
                "Archived class {} is not used: shared path entry {} was invalidated",
                name, entry.path_index
            );
            return None;
        }
        // SAFETY: the stub lies in the mc region of `archive`, which stays mapped while `self` is alive.
        let stub = unsafe { read_stub(entry.stub) };
        if stub != entry.metadata || !self.is_in_shared_metaspace(stub.start) {
            warn!("Archived class {} has a corrupted stub: {:?}", name, stub);
            return None;
        }
        if let Err(e) = cld.allocate_metadata(SHARED_CLASS_RECORD_SIZE) {
            warn!("Unable to restore archived class {}: {}", name, e);
            return None;
        }
        let klass = Arc::new(Klass {
            name: name.to_owned(),
            metadata: entry.metadata,
            path_index: entry.path_index,
            shared: true,
        });
        cld.add_class(klass.clone());
        trace!("Restored {} into {} from the {:?} archive", name, cld.index(), layer);
        Some(klass)
    }

    /// Make the read-only region of every layer writable, so that archived classes can be
    /// redefined. All mutators must be parked.
    pub fn remap_shared_readonly_as_readwrite(&self, safepoint: &SafepointGuard) -> Result<()> {
        for archive in self.archives() {
            archive.remap_shared_readonly_as_readwrite(safepoint)?;
        }
        Ok(())
    }

    /// Write the static archive of the classes currently loaded to `shared_archive_file`.
    pub fn dump_static_archive(&self, heap: Option<&ArchivedHeapSnapshot>) -> FileMapHeader {
        let path = self.options.shared_archive_file.clone();
        dump::dump_static_archive(&self.dump_context(), Path::new(&path), heap)
    }

    /// Write a dynamic archive on top of the mapped static archive to `dynamic_archive_file`.
    pub fn dump_dynamic_archive(&self) -> FileMapHeader {
        let Some(base) = &self.static_archive else {
            fail_stop("A dynamic archive can only be dumped while a static archive is mapped");
        };
        let Some(path) = self.options.dynamic_archive() else {
            fail_stop("No dynamic archive file is configured");
        };
        dump::dump_dynamic_archive(&self.dump_context(), Path::new(path), base.info())
    }

    fn dump_context(&self) -> DumpContext<'_> {
        DumpContext {
            options: &self.options,
            env: &self.env,
            resolver: &*self.resolver,
            graph: &self.graph,
            heap: &*self.heap,
        }
    }

    fn archives(&self) -> impl Iterator<Item = &MappedArchive> {
        self.static_archive.iter().chain(self.dynamic_archive.iter())
    }

    pub fn graph(&self) -> &ClassLoaderDataGraph {
        &self.graph
    }

    /// Visit the loader object and the handles of every live class loader data, spreading
    /// the walk over `root_walk_threads` workers. Each object is reported by one worker.
    pub fn class_loader_roots_do(&self, f: &(dyn Fn(ObjectReference) + Sync)) {
        self.graph
            .parallel_claimed_cld_do(self.options.root_walk_threads, &|cld| cld.oops_do(&mut |obj| f(obj)));
    }

    pub fn safepoint(&self) -> Arc<SafepointSynchronizer> {
        self.safepoint.clone()
    }

    pub fn env(&self) -> &VMEnvironment {
        &self.env
    }

    pub fn static_archive(&self) -> Option<&MappedArchive> {
        self.static_archive.as_ref()
    }

    pub fn dynamic_archive(&self) -> Option<&MappedArchive> {
        self.dynamic_archive.as_ref()
    }

    pub fn num_shared_classes(&self) -> usize {
        self.shared_classes.len()
    }
}

impl Drop for SharedSpaces {
    fn drop(&mut self) {
        // The dynamic layer sits on top of the static one.
        self.dynamic_archive = None;
        self.static_archive = None;
    }
}
