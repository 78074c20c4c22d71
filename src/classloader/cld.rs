use super::handles::{ChunkedHandleList, OopHandle};
use super::metaspace::{ClassLoaderMetaspace, Metaspace};
use super::{CldIndex, LoaderKind};
use crate::error::Result;
use crate::util::{Address, MemRange, ObjectReference};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A class defined by a loader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Klass {
    pub name: String,
    /// The class metadata, either in the defining loader's arena or in a mapped archive.
    pub metadata: MemRange,
    /// The shared path entry the class was loaded from, or -1.
    pub path_index: i32,
    /// Was the class restored from an archive?
    pub shared: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleEntry {
    pub name: String,
    pub location: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageEntry {
    pub name: String,
    pub module: Option<String>,
}

/// The metadata bookkeeping of one class loader.
///
/// The arena is created on the first metadata allocation. Classes are only ever appended
/// until the loader is purged. The boot loader's data, and the data of an unsafe anonymous
/// class, start with a keep-alive count of 1 since they have no loader object to keep them
/// reachable.
pub struct ClassLoaderData {
    index: CldIndex,
    loader: ObjectReference,
    kind: LoaderKind,
    unsafe_anonymous: bool,
    space: Arc<Metaspace>,
    metaspace: spin::Mutex<Option<ClassLoaderMetaspace>>,
    classes: Mutex<Vec<Arc<Klass>>>,
    modules: Mutex<HashMap<String, ModuleEntry>>,
    packages: Mutex<HashMap<String, PackageEntry>>,
    dependencies: Mutex<Vec<CldIndex>>,
    handles: ChunkedHandleList,
    deallocate_list: Mutex<Vec<MemRange>>,
    unloading: AtomicBool,
    keep_alive: AtomicI32,
    claimed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ClassLoaderData {
    pub(super) fn new(
        index: CldIndex,
        loader: ObjectReference,
        kind: LoaderKind,
        unsafe_anonymous: bool,
        space: Arc<Metaspace>,
    ) -> Self {
        let keep_alive = if unsafe_anonymous || loader.is_null() { 1 } else { 0 };
        ClassLoaderData {
            index,
            loader,
            kind,
            unsafe_anonymous,
            space,
            metaspace: spin::Mutex::new(None),
            classes: Mutex::new(vec![]),
            modules: Mutex::new(HashMap::new()),
            packages: Mutex::new(HashMap::new()),
            dependencies: Mutex::new(vec![]),
            handles: ChunkedHandleList::new(),
            deallocate_list: Mutex::new(vec![]),
            unloading: AtomicBool::new(false),
            keep_alive: AtomicI32::new(keep_alive),
            claimed: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> CldIndex {
        self.index
    }

    /// The loader object. Null for the boot loader.
    pub fn class_loader(&self) -> ObjectReference {
        self.loader
    }

    pub fn loader_kind(&self) -> LoaderKind {
        self.kind
    }

    pub fn is_the_null_class_loader_data(&self) -> bool {
        self.index == CldIndex::BOOT
    }

    pub fn is_unsafe_anonymous(&self) -> bool {
        self.unsafe_anonymous
    }

    /// Is the arena allocated?
    pub fn has_metaspace(&self) -> bool {
        self.metaspace.lock().is_some()
    }

    /// Allocate metadata, creating the arena on first use.
    pub fn allocate_metadata(&self, size: usize) -> Result<Address> {
        let mut metaspace = self.metaspace.lock();
        if metaspace.is_none() {
            debug!("Creating metaspace arena for {} ({})", self.index, self.kind);
        }
        metaspace
            .get_or_insert_with(|| ClassLoaderMetaspace::new(self.space.clone(), self.index))
            .allocate(size)
    }

    pub fn metaspace_used_bytes(&self) -> usize {
        self.metaspace.lock().as_ref().map_or(0, |m| m.used_bytes())
    }

    /// Define a class from metadata produced by the class file parser: the bytes are
    /// copied into this loader's arena.
    pub fn define_class(&self, name: &str, metadata: &[u8], path_index: i32) -> Result<Arc<Klass>> {
        let addr = self.allocate_metadata(metadata.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(metadata.as_ptr(), addr.to_mut_ptr::<u8>(), metadata.len());
        }
        let klass = Arc::new(Klass {
            name: name.to_string(),
            metadata: MemRange::new(addr, metadata.len()),
            path_index,
            shared: false,
        });
        self.add_class(klass.clone());
        Ok(klass)
    }

    pub fn add_class(&self, klass: Arc<Klass>) {
        trace!("{}: adding class {}", self.index, klass.name);
        lock(&self.classes).push(klass);
    }

    pub fn find_class(&self, name: &str) -> Option<Arc<Klass>> {
        lock(&self.classes).iter().find(|k| k.name == name).cloned()
    }

    pub fn classes_do(&self, f: &mut dyn FnMut(&Arc<Klass>)) {
        for klass in lock(&self.classes).iter() {
            f(klass);
        }
    }

    pub fn num_classes(&self) -> usize {
        lock(&self.classes).len()
    }

    /// Remove a class. Only the purge of this loader may do this.
    pub(super) fn remove_class(&self, name: &str) -> Option<Arc<Klass>> {
        let mut classes = lock(&self.classes);
        let i = classes.iter().position(|k| k.name == name)?;
        Some(classes.remove(i))
    }

    pub fn add_module(&self, module: ModuleEntry) {
        lock(&self.modules).insert(module.name.clone(), module);
    }

    pub fn find_module(&self, name: &str) -> Option<ModuleEntry> {
        lock(&self.modules).get(name).cloned()
    }

    pub fn add_package(&self, package: PackageEntry) {
        lock(&self.packages).insert(package.name.clone(), package);
    }

    pub fn find_package(&self, name: &str) -> Option<PackageEntry> {
        lock(&self.packages).get(name).cloned()
    }

    pub fn packages_do(&self, f: &mut dyn FnMut(&PackageEntry)) {
        for package in lock(&self.packages).values() {
            f(package);
        }
    }

    pub(super) fn add_dependency(&self, to: CldIndex) -> bool {
        let mut deps = lock(&self.dependencies);
        if deps.contains(&to) {
            false
        } else {
            deps.push(to);
            true
        }
    }

    pub fn dependencies(&self) -> Vec<CldIndex> {
        lock(&self.dependencies).clone()
    }

    /// Register an extra GC root owned by this loader.
    pub fn add_handle(&self, obj: ObjectReference) -> OopHandle {
        self.handles.add(obj)
    }

    pub fn remove_handle(&self, handle: OopHandle) {
        self.handles.release(handle)
    }

    /// Visit the loader object and every handle.
    pub fn oops_do(&self, f: &mut dyn FnMut(ObjectReference)) {
        if !self.loader.is_null() {
            f(self.loader);
        }
        self.handles.oops_do(f);
    }

    /// Claim this node for the current walk. Exactly one caller wins per walk.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn clear_claimed(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    pub fn claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn is_unloading(&self) -> bool {
        self.unloading.load(Ordering::Acquire)
    }

    pub(super) fn set_unloading(&self) {
        debug_assert!(!self.is_the_null_class_loader_data());
        self.unloading.store(true, Ordering::Release);
    }

    pub fn keep_alive_count(&self) -> i32 {
        self.keep_alive.load(Ordering::Acquire)
    }

    pub fn inc_keep_alive(&self) {
        self.keep_alive.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_keep_alive(&self) {
        let old = self.keep_alive.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "keep alive count of {} went negative", self.index);
    }

    /// Is this loader a root regardless of reachability of its loader object?
    pub fn keep_alive(&self) -> bool {
        self.keep_alive_count() > 0
    }

    /// Queue metadata to be freed at the next safepoint.
    pub fn add_to_deallocate_list(&self, block: MemRange) {
        lock(&self.deallocate_list).push(block);
    }

    pub fn deallocate_list_len(&self) -> usize {
        lock(&self.deallocate_list).len()
    }

    /// Free the queued metadata into the arena.
    pub(super) fn free_deallocate_list(&self) -> usize {
        let blocks: Vec<MemRange> = std::mem::take(&mut *lock(&self.deallocate_list));
        let mut metaspace = self.metaspace.lock();
        if let Some(arena) = metaspace.as_mut() {
            for block in &blocks {
                if arena.contains(block.start) {
                    arena.deallocate(*block);
                }
            }
        }
        blocks.len()
    }

    /// Release everything this loader owns. Called once, from the purge.
    pub(super) fn unload(&self) {
        debug!(
            "Unloading {} ({}, {} classes)",
            self.index,
            self.kind,
            self.num_classes()
        );
        let names: Vec<String> = lock(&self.classes).iter().map(|k| k.name.clone()).collect();
        for name in names {
            self.remove_class(&name);
        }
        lock(&self.deallocate_list).clear();
        lock(&self.modules).clear();
        lock(&self.packages).clear();
        lock(&self.dependencies).clear();
        // Dropping the arena hands its chunks back to the metaspace.
        self.metaspace.lock().take();
    }
}

impl std::fmt::Debug for ClassLoaderData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassLoaderData")
            .field("index", &self.index)
            .field("loader", &self.loader)
            .field("kind", &self.kind)
            .field("unsafe_anonymous", &self.unsafe_anonymous)
            .field("unloading", &self.is_unloading())
            .field("keep_alive", &self.keep_alive_count())
            .finish()
    }
}
