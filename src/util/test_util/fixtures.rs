// Not every scenario uses every helper.
#![allow(dead_code)]

use crate::archive::FileMapHeader;
use crate::classloader::LoaderKind;
use crate::util::options::Options;
use crate::util::test_util::probe_free_range;
use crate::util::{Address, ObjectReference};
use crate::vm::{ArchiveHeap, ClassPathEntry, NoArchiveHeap, StaticClassPath, VMEnvironment};
use crate::SharedSpaces;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const TEST_VM_VERSION: &str = "TestVM (25.0-internal) for linux-amd64, built on Oct 19 2026";

/// Size of the address range probed for the archive base. The base sits in the middle of it.
const BASE_PROBE_SIZE: usize = 64 << 20;

/// A class to define before dumping.
#[derive(Clone, Debug)]
pub struct TestClass {
    pub loader: LoaderKind,
    pub name: &'static str,
    pub metadata: Vec<u8>,
    pub path_index: i32,
}

impl TestClass {
    pub fn boot(name: &'static str) -> Self {
        TestClass {
            loader: LoaderKind::Boot,
            name,
            metadata: name.bytes().rev().collect(),
            path_index: 0,
        }
    }

    /// A class from the application jar, which is entry 1 of the shared path table.
    pub fn app(name: &'static str) -> Self {
        TestClass {
            loader: LoaderKind::App,
            name,
            metadata: name.as_bytes().repeat(3),
            path_index: 1,
        }
    }
}

/// The loader object standing in for each built-in loader.
pub fn loader_ref(kind: LoaderKind) -> ObjectReference {
    match kind {
        LoaderKind::Boot => ObjectReference::NULL,
        LoaderKind::Platform => ObjectReference::from_raw_address(unsafe { Address::from_usize(0x1000) }),
        LoaderKind::App => ObjectReference::from_raw_address(unsafe { Address::from_usize(0x2000) }),
        LoaderKind::Custom => ObjectReference::from_raw_address(unsafe { Address::from_usize(0x3000) }),
    }
}

/// A temporary directory with a modules image and an application jar, and an archive base
/// address that is currently unmapped.
pub struct ArchiveFixture {
    pub dir: TempDir,
    pub modules: PathBuf,
    pub app_jar: PathBuf,
    pub base: Address,
}

impl ArchiveFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let modules = dir.path().join("modules");
        let app_jar = dir.path().join("app.jar");
        fs::write(&modules, vec![0x4du8; 4096]).unwrap();
        fs::write(&app_jar, vec![0x50u8; 512]).unwrap();
        let base = probe_free_range(BASE_PROBE_SIZE) + BASE_PROBE_SIZE / 4;
        ArchiveFixture {
            dir,
            modules,
            app_jar,
            base,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn static_archive(&self) -> PathBuf {
        self.path("static.jsa")
    }

    pub fn dynamic_archive(&self) -> PathBuf {
        self.path("top.jsa")
    }

    pub fn resolver(&self) -> StaticClassPath {
        StaticClassPath::new(&self.modules).append_app(ClassPathEntry::new(&self.app_jar))
    }

    pub fn env(&self) -> VMEnvironment {
        VMEnvironment::new(TEST_VM_VERSION)
    }

    /// Options that map (or dump) the static archive of this fixture, with verification on.
    pub fn options(&self) -> Options {
        let mut options = Options::builtin_defaults();
        options.shared_archive_file = self.static_archive().to_string_lossy().into_owned();
        options.shared_base_address = self.base.as_usize();
        options.verify_shared_spaces = true;
        options.metaspace_reserve_size = 4 << 20;
        options.root_walk_threads = 2;
        options
    }

    pub fn spaces(&self, options: Options, heap: Arc<dyn ArchiveHeap>) -> SharedSpaces {
        SharedSpaces::new(options, self.env(), heap, Box::new(self.resolver())).unwrap()
    }

    /// A context that is only used for dumping.
    pub fn dump_spaces(&self, heap: Arc<dyn ArchiveHeap>) -> SharedSpaces {
        let mut options = self.options();
        options.use_shared_spaces = false;
        self.spaces(options, heap)
    }

    /// Define `classes` in `spaces`.
    pub fn define(spaces: &SharedSpaces, classes: &[TestClass]) {
        for class in classes {
            let cld = spaces.graph().find_or_create(loader_ref(class.loader), class.loader);
            cld.define_class(class.name, &class.metadata, class.path_index).unwrap();
        }
    }

    /// Dump a static archive holding `classes`, without archived heap objects.
    pub fn dump_static(&self, classes: &[TestClass]) -> FileMapHeader {
        let spaces = self.dump_spaces(Arc::new(NoArchiveHeap));
        Self::define(&spaces, classes);
        spaces.dump_static_archive(None)
    }
}

impl Default for ArchiveFixture {
    fn default() -> Self {
        Self::new()
    }
}
