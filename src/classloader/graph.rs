use super::cld::{ClassLoaderData, Klass};
use super::metaspace::Metaspace;
use super::{CldIndex, LoaderKind};
use crate::util::safepoint::SafepointGuard;
use crate::util::{Address, ObjectReference};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

const NONE: usize = usize::MAX;

struct Slot {
    /// `None` once the node has been purged. Indices are never reused.
    cld: Option<Arc<ClassLoaderData>>,
    next: AtomicUsize,
}

/// The registry of every [`ClassLoaderData`].
///
/// Nodes live in an arena indexed by [`CldIndex`] and are chained through per-slot `next`
/// links, newest first. Two chains exist: the live list, and the list of nodes found dead by
/// [`ClassLoaderDataGraph::do_unloading`] that wait for [`ClassLoaderDataGraph::purge`].
///
/// Insertion is serialized by the add lock. Walkers never take it: they only hold the arena's
/// read lock for the duration of one step, so a walk may run concurrently with insertion and
/// with other walks. Unlinking and purging require a [`SafepointGuard`].
pub struct ClassLoaderDataGraph {
    space: Arc<Metaspace>,
    slots: RwLock<Vec<Slot>>,
    head: AtomicUsize,
    unloading_head: AtomicUsize,
    /// The primary node of each loader object. Guarded together with insertion.
    add_lock: Mutex<HashMap<ObjectReference, CldIndex>>,
}

impl ClassLoaderDataGraph {
    /// Create the graph and the boot loader's node.
    pub fn new(space: Arc<Metaspace>) -> Self {
        let boot = Arc::new(ClassLoaderData::new(
            CldIndex::BOOT,
            ObjectReference::NULL,
            LoaderKind::Boot,
            false,
            space.clone(),
        ));
        ClassLoaderDataGraph {
            space,
            slots: RwLock::new(vec![Slot {
                cld: Some(boot),
                next: AtomicUsize::new(NONE),
            }]),
            head: AtomicUsize::new(CldIndex::BOOT.0),
            unloading_head: AtomicUsize::new(NONE),
            add_lock: Mutex::new(HashMap::new()),
        }
    }

    pub fn metaspace(&self) -> &Arc<Metaspace> {
        &self.space
    }

    /// The boot loader's node. It exists for the whole lifetime of the graph.
    pub fn boot(&self) -> Arc<ClassLoaderData> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())[CldIndex::BOOT.0]
            .cld
            .clone()
            .unwrap_or_else(|| unreachable!("the boot class loader data is never purged"))
    }

    pub fn get(&self, index: CldIndex) -> Option<Arc<ClassLoaderData>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.get(index.0).and_then(|slot| slot.cld.clone())
    }

    /// The primary node of `loader`, if one has been registered and not unloaded.
    pub fn lookup(&self, loader: ObjectReference) -> Option<Arc<ClassLoaderData>> {
        if loader.is_null() {
            return Some(self.boot());
        }
        let index = *self.add_lock.lock().unwrap_or_else(|e| e.into_inner()).get(&loader)?;
        self.get(index)
    }

    /// The primary node of `loader`, registering it on first use. A null loader is the boot
    /// loader.
    pub fn find_or_create(&self, loader: ObjectReference, kind: LoaderKind) -> Arc<ClassLoaderData> {
        if loader.is_null() {
            return self.boot();
        }
        let mut loader_map = self.add_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cld) = loader_map.get(&loader).and_then(|index| self.get(*index)) {
            debug_assert_eq!(cld.loader_kind(), kind);
            return cld;
        }
        let cld = self.link_new(loader, kind, false);
        loader_map.insert(loader, cld.index());
        cld
    }

    /// Register a node for one unsafe anonymous class defined through `host_loader`. Such
    /// nodes are never the primary node of a loader.
    pub fn add_unsafe_anonymous(&self, host_loader: ObjectReference, kind: LoaderKind) -> Arc<ClassLoaderData> {
        let _guard = self.add_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.link_new(host_loader, kind, true)
    }

    /// Caller holds the add lock.
    fn link_new(&self, loader: ObjectReference, kind: LoaderKind, unsafe_anonymous: bool) -> Arc<ClassLoaderData> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let index = CldIndex(slots.len());
        let cld = Arc::new(ClassLoaderData::new(
            index,
            loader,
            kind,
            unsafe_anonymous,
            self.space.clone(),
        ));
        slots.push(Slot {
            cld: Some(cld.clone()),
            next: AtomicUsize::new(self.head.load(Ordering::Relaxed)),
        });
        self.head.store(index.0, Ordering::Release);
        debug!(
            "Registered {} for loader {} ({}{})",
            index,
            loader,
            kind,
            if unsafe_anonymous { ", unsafe anonymous" } else { "" }
        );
        cld
    }

    fn step(&self, index: usize) -> Option<(Arc<ClassLoaderData>, usize)> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let slot = slots.get(index)?;
        Some((slot.cld.clone()?, slot.next.load(Ordering::Acquire)))
    }

    fn walk(&self, head: &AtomicUsize, f: &mut dyn FnMut(&Arc<ClassLoaderData>)) {
        let mut cur = head.load(Ordering::Acquire);
        while cur != NONE {
            let Some((cld, next)) = self.step(cur) else {
                break;
            };
            f(&cld);
            cur = next;
        }
    }

    /// Visit every live node.
    pub fn cld_do(&self, f: &mut dyn FnMut(&Arc<ClassLoaderData>)) {
        self.walk(&self.head, f)
    }

    /// Visit every node waiting to be purged.
    pub fn unloading_cld_do(&self, f: &mut dyn FnMut(&Arc<ClassLoaderData>)) {
        self.walk(&self.unloading_head, f)
    }

    /// Visit live nodes that must be kept alive regardless of reachability with `strong`,
    /// and the rest with `weak`.
    pub fn roots_cld_do(
        &self,
        strong: &mut dyn FnMut(&Arc<ClassLoaderData>),
        weak: &mut dyn FnMut(&Arc<ClassLoaderData>),
    ) {
        self.cld_do(&mut |cld| {
            if cld.keep_alive() {
                strong(cld)
            } else {
                weak(cld)
            }
        })
    }

    pub fn always_strong_cld_do(&self, f: &mut dyn FnMut(&Arc<ClassLoaderData>)) {
        self.roots_cld_do(f, &mut |_| {})
    }

    /// Visit the live nodes this walk manages to claim. Claims persist until
    /// [`ClassLoaderDataGraph::clear_claimed_marks`].
    pub fn claimed_cld_do(&self, f: &mut dyn FnMut(&Arc<ClassLoaderData>)) {
        self.cld_do(&mut |cld| {
            if cld.claim() {
                f(cld)
            }
        })
    }

    pub fn clear_claimed_marks(&self) {
        self.cld_do(&mut |cld| cld.clear_claimed())
    }

    /// Walk the live list with `workers` threads. Every node is visited by exactly one of
    /// them.
    pub fn parallel_claimed_cld_do(&self, workers: usize, f: &(dyn Fn(&Arc<ClassLoaderData>) + Sync)) {
        self.clear_claimed_marks();
        let result = crossbeam::thread::scope(|s| {
            for _ in 0..workers.max(1) {
                s.spawn(|_| {
                    self.cld_do(&mut |cld| {
                        if cld.claim() {
                            f(cld)
                        }
                    })
                });
            }
        });
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }

    /// Visit the classes of every live node.
    pub fn loaded_classes_do(&self, f: &mut dyn FnMut(&Arc<ClassLoaderData>, &Arc<Klass>)) {
        self.cld_do(&mut |cld| cld.classes_do(&mut |klass| f(cld, klass)))
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        let mut n = 0;
        self.cld_do(&mut |_| n += 1);
        n
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == NONE
    }

    pub fn num_unloading(&self) -> usize {
        let mut n = 0;
        self.unloading_cld_do(&mut |_| n += 1);
        n
    }

    /// The node whose arena holds the metadata at `addr`.
    pub fn cld_for_metadata(&self, addr: Address) -> Option<Arc<ClassLoaderData>> {
        self.get(self.space.chunk_owner(addr)?)
    }

    /// Keep `to` alive for as long as `from` is alive.
    pub fn record_dependency(&self, from: &ClassLoaderData, to: &ClassLoaderData) {
        if from.index() == to.index() || from.is_the_null_class_loader_data() || to.is_the_null_class_loader_data() {
            return;
        }
        if from.add_dependency(to.index()) {
            trace!("{} depends on {}", from.index(), to.index());
        }
    }

    /// Find the unreachable nodes and move them to the unloading list.
    ///
    /// A node stays alive if `is_alive` says so, if its keep-alive count is positive, if it
    /// is the boot loader's, or if a live node depends on it. Returns `true` if anything was
    /// unlinked.
    pub fn do_unloading(&self, _safepoint: &SafepointGuard, is_alive: &dyn Fn(&ClassLoaderData) -> bool) -> bool {
        let mut nodes = vec![];
        self.cld_do(&mut |cld| nodes.push(cld.clone()));

        let mut alive: HashMap<CldIndex, bool> = nodes
            .iter()
            .map(|cld| {
                let live = cld.is_the_null_class_loader_data() || cld.keep_alive() || is_alive(cld);
                (cld.index(), live)
            })
            .collect();
        let mut worklist: Vec<CldIndex> = nodes
            .iter()
            .filter(|cld| alive[&cld.index()])
            .map(|cld| cld.index())
            .collect();
        while let Some(index) = worklist.pop() {
            let Some(cld) = self.get(index) else { continue };
            for dep in cld.dependencies() {
                if let Some(live) = alive.get_mut(&dep) {
                    if !*live {
                        *live = true;
                        worklist.push(dep);
                    }
                }
            }
        }

        let dead: Vec<&Arc<ClassLoaderData>> = nodes.iter().filter(|cld| !alive[&cld.index()]).collect();
        if dead.is_empty() {
            return false;
        }

        let mut loader_map = self.add_lock.lock().unwrap_or_else(|e| e.into_inner());
        let slots = self.slots.write().unwrap_or_else(|e| e.into_inner());

        // Unlink the dead from the list as it is now: nodes registered while `is_alive` ran
        // are not in `alive` and stay linked.
        let mut prev: Option<usize> = None;
        let mut cur = self.head.load(Ordering::Acquire);
        while cur != NONE {
            let next = slots[cur].next.load(Ordering::Acquire);
            if alive.get(&CldIndex(cur)) == Some(&false) {
                match prev {
                    None => self.head.store(next, Ordering::Release),
                    Some(p) => slots[p].next.store(next, Ordering::Release),
                }
            } else {
                prev = Some(cur);
            }
            cur = next;
        }

        for cld in dead {
            cld.set_unloading();
            if !cld.is_unsafe_anonymous() && loader_map.get(&cld.class_loader()) == Some(&cld.index()) {
                loader_map.remove(&cld.class_loader());
            }
            let index = cld.index().0;
            slots[index]
                .next
                .store(self.unloading_head.load(Ordering::Relaxed), Ordering::Release);
            self.unloading_head.store(index, Ordering::Release);
            debug!("{} ({}) is unloading", cld.index(), cld.loader_kind());
        }
        true
    }

    /// Release every node on the unloading list. Returns the number of nodes purged.
    pub fn purge(&self, _safepoint: &SafepointGuard) -> usize {
        let mut purged = vec![];
        self.unloading_cld_do(&mut |cld| purged.push(cld.clone()));
        for cld in &purged {
            cld.unload();
        }
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        for cld in &purged {
            let slot = &mut slots[cld.index().0];
            slot.cld = None;
            slot.next.store(NONE, Ordering::Relaxed);
        }
        self.unloading_head.store(NONE, Ordering::Release);
        if !purged.is_empty() {
            info!("Purged {} class loader data", purged.len());
        }
        purged.len()
    }

    /// Free the deferred metadata of every live node. Returns the number of blocks freed.
    pub fn free_deallocate_lists(&self, _safepoint: &SafepointGuard) -> usize {
        let mut freed = 0;
        self.cld_do(&mut |cld| freed += cld.free_deallocate_list());
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;
    use crate::util::safepoint::SafepointSynchronizer;

    fn graph() -> ClassLoaderDataGraph {
        ClassLoaderDataGraph::new(Arc::new(Metaspace::new(BYTES_IN_PAGE * 256, BYTES_IN_PAGE * 4).unwrap()))
    }

    fn loader(v: usize) -> ObjectReference {
        ObjectReference::from_raw_address(unsafe { Address::from_usize(v) })
    }

    fn indices(graph: &ClassLoaderDataGraph) -> Vec<usize> {
        let mut out = vec![];
        graph.cld_do(&mut |cld| out.push(cld.index().0));
        out
    }

    #[test]
    fn one_primary_node_per_loader() {
        let graph = graph();
        assert_eq!(graph.len(), 1);
        assert!(graph.boot().is_the_null_class_loader_data());
        assert!(Arc::ptr_eq(&graph.find_or_create(ObjectReference::NULL, LoaderKind::Boot), &graph.boot()));

        let a = graph.find_or_create(loader(0x1000), LoaderKind::App);
        let a2 = graph.find_or_create(loader(0x1000), LoaderKind::App);
        assert!(Arc::ptr_eq(&a, &a2));
        let anon = graph.add_unsafe_anonymous(loader(0x1000), LoaderKind::App);
        assert_ne!(anon.index(), a.index());
        assert!(Arc::ptr_eq(&graph.lookup(loader(0x1000)).unwrap(), &a));
        // newest first
        assert_eq!(indices(&graph), vec![2, 1, 0]);
    }

    #[test]
    fn unloading_follows_dependencies_and_keep_alive() {
        let graph = graph();
        let sync = SafepointSynchronizer::new();
        let live = graph.find_or_create(loader(0x1000), LoaderKind::App);
        let dep = graph.find_or_create(loader(0x2000), LoaderKind::Custom);
        let dead = graph.find_or_create(loader(0x3000), LoaderKind::Custom);
        let anon = graph.add_unsafe_anonymous(loader(0x3000), LoaderKind::Custom);
        dead.define_class("d/D", b"dead", -1).unwrap();
        graph.record_dependency(&live, &dep);
        graph.record_dependency(&live, &live);
        graph.record_dependency(&live, &graph.boot());
        assert_eq!(live.dependencies(), vec![dep.index()]);

        let sp = sync.begin();
        let unloaded = graph.do_unloading(&sp, &|cld| cld.class_loader() == loader(0x1000));
        assert!(unloaded);
        assert!(dead.is_unloading());
        assert!(!dep.is_unloading());
        assert!(!anon.is_unloading());
        assert_eq!(graph.num_unloading(), 1);
        assert_eq!(indices(&graph), vec![4, 2, 1, 0]);
        assert!(graph.lookup(loader(0x3000)).is_none());

        let chunks_before = graph.metaspace().committed_chunks();
        assert_eq!(graph.purge(&sp), 1);
        assert_eq!(graph.metaspace().committed_chunks(), chunks_before - 1);
        assert!(graph.get(dead.index()).is_none());
        assert_eq!(graph.num_unloading(), 0);

        // Nothing else is dead.
        assert!(!graph.do_unloading(&sp, &|_| false));
        anon.dec_keep_alive();
        assert!(graph.do_unloading(&sp, &|cld| cld.index() == live.index()));
        assert_eq!(indices(&graph), vec![2, 1, 0]);
        assert!(!graph.boot().is_unloading());
    }

    #[test]
    fn loader_registered_during_unloading_stays_linked() {
        let graph = graph();
        let sync = SafepointSynchronizer::new();
        let app = graph.find_or_create(loader(0x1000), LoaderKind::App);
        let custom = graph.find_or_create(loader(0x2000), LoaderKind::Custom);

        let sp = sync.begin();
        let unloaded = graph.do_unloading(&sp, &|cld| {
            if cld.index() == app.index() {
                graph.find_or_create(loader(0x3000), LoaderKind::Platform);
                return false;
            }
            true
        });
        assert!(unloaded);
        assert!(app.is_unloading());
        assert!(!custom.is_unloading());

        let platform = graph.lookup(loader(0x3000)).unwrap();
        assert!(!platform.is_unloading());
        assert_eq!(indices(&graph), vec![platform.index().0, custom.index().0, 0]);
        assert_eq!(graph.num_unloading(), 1);
        assert_eq!(graph.purge(&sp), 1);
        assert!(Arc::ptr_eq(&graph.lookup(loader(0x3000)).unwrap(), &platform));
    }

    #[test]
    fn held_loader_survives_until_released() {
        let graph = graph();
        let sync = SafepointSynchronizer::new();
        let held = graph.find_or_create(loader(0x1000), LoaderKind::Custom);
        held.inc_keep_alive();
        let sp = sync.begin();
        assert!(!graph.do_unloading(&sp, &|_| false));
        assert_eq!(indices(&graph), vec![held.index().0, 0]);

        held.dec_keep_alive();
        assert!(graph.do_unloading(&sp, &|_| false));
        assert!(held.is_unloading());
        assert_eq!(indices(&graph), vec![0]);
    }

    #[test]
    fn a_new_loader_gets_a_new_node_after_unloading() {
        let graph = graph();
        let sync = SafepointSynchronizer::new();
        let first = graph.find_or_create(loader(0x1000), LoaderKind::Custom);
        {
            let sp = sync.begin();
            graph.do_unloading(&sp, &|_| false);
            graph.purge(&sp);
        }
        let second = graph.find_or_create(loader(0x1000), LoaderKind::Custom);
        assert_ne!(first.index(), second.index());
    }

    #[test]
    fn roots_split_by_keep_alive() {
        let graph = graph();
        graph.find_or_create(loader(0x1000), LoaderKind::App);
        graph.add_unsafe_anonymous(loader(0x1000), LoaderKind::App);
        let (mut strong, mut weak) = (vec![], vec![]);
        graph.roots_cld_do(&mut |c| strong.push(c.index().0), &mut |c| weak.push(c.index().0));
        assert_eq!(strong, vec![2, 0]);
        assert_eq!(weak, vec![1]);
        let mut always = vec![];
        graph.always_strong_cld_do(&mut |c| always.push(c.index().0));
        assert_eq!(always, strong);
    }

    #[test]
    fn claimed_walks_visit_once() {
        let graph = graph();
        for i in 1..=50 {
            graph.find_or_create(loader(i * 0x100), LoaderKind::Custom);
        }
        let mut n = 0;
        graph.claimed_cld_do(&mut |_| n += 1);
        assert_eq!(n, 51);
        graph.claimed_cld_do(&mut |_| n += 1);
        assert_eq!(n, 51);

        let visits: Vec<AtomicUsize> = (0..51).map(|_| AtomicUsize::new(0)).collect();
        graph.parallel_claimed_cld_do(4, &|cld| {
            visits[cld.index().0].fetch_add(1, Ordering::SeqCst);
        });
        assert!(visits.iter().all(|v| v.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn walk_while_adding() {
        let graph = Arc::new(graph());
        let adder = {
            let graph = graph.clone();
            std::thread::spawn(move || {
                for i in 1..=200 {
                    graph.find_or_create(loader(i * 0x100), LoaderKind::Custom);
                }
            })
        };
        for _ in 0..50 {
            let mut saw_boot = false;
            graph.cld_do(&mut |cld| saw_boot |= cld.is_the_null_class_loader_data());
            assert!(saw_boot);
        }
        adder.join().unwrap();
        assert_eq!(graph.len(), 201);
    }

    #[test]
    fn metadata_owner_and_deferred_free() {
        let graph = graph();
        let sync = SafepointSynchronizer::new();
        let cld = graph.find_or_create(loader(0x1000), LoaderKind::App);
        let klass = cld.define_class("a/A", b"klass", 1).unwrap();
        assert_eq!(graph.cld_for_metadata(klass.metadata.start).unwrap().index(), cld.index());
        let mut names = vec![];
        graph.loaded_classes_do(&mut |_, k| names.push(k.name.clone()));
        assert_eq!(names, vec!["a/A".to_string()]);

        cld.add_to_deallocate_list(klass.metadata);
        let sp = sync.begin();
        assert_eq!(graph.free_deallocate_lists(&sp), 1);
    }
}
